use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

type KeyCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type ValueCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by the subscribe methods. Call [`Subscription::unsubscribe`]
/// to detach the callback; dropping the handle leaves the subscription active.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.0.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct StoreState {
    value: Value,
    initial: Value,
    subs: HashMap<u64, ValueCallback>,
}

struct StoreInner {
    key: String,
    state: Mutex<StoreState>,
    factory: Weak<FactoryInner>,
}

/// A named reactive cell holding a JSON value.
///
/// Callbacks are invoked synchronously while the cell's lock is held so that
/// observers see mutations in acceptance order. Callbacks must therefore not
/// call back into the same store or the owning factory.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn get(&self) -> Value {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).value.clone()
    }

    pub fn set(&self, value: Value) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.value = value;
        for sub in state.subs.values() {
            sub(&state.value);
        }
        if let Some(factory) = self.inner.factory.upgrade() {
            let change_subs = factory.change_subs.lock().unwrap_or_else(|e| e.into_inner());
            for sub in change_subs.values() {
                sub(&self.inner.key, &state.value);
            }
        }
    }

    /// Restore the value the store was created with.
    pub fn reset(&self) {
        let initial = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.initial.clone()
        };
        self.set(initial);
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .factory
            .upgrade()
            .map(|f| f.next_sub.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(0);
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subs
            .insert(id, Arc::new(callback));

        let inner = Arc::downgrade(&self.inner);
        Subscription(Some(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .subs
                    .remove(&id);
            }
        })))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("key", &self.inner.key).finish()
    }
}

struct FactoryInner {
    stores: Mutex<HashMap<String, Arc<StoreInner>>>,
    create_subs: Mutex<HashMap<u64, KeyCallback>>,
    change_subs: Mutex<HashMap<u64, KeyCallback>>,
    next_sub: AtomicU64,
}

/// Registry of all stores in the process plus the two global subscriptions
/// (`subscribe_create`, `subscribe_change`) the inspector bridges to its
/// broadcast hub.
#[derive(Clone)]
pub struct StoreFactory {
    inner: Arc<FactoryInner>,
}

impl StoreFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                stores: Mutex::new(HashMap::new()),
                create_subs: Mutex::new(HashMap::new()),
                change_subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(1),
            }),
        }
    }

    /// Create a store with an initial value, or return the existing one.
    /// Create subscribers fire only for genuinely new keys.
    pub fn create(&self, key: &str, value: Value) -> Store {
        let mut stores = self.inner.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = stores.get(key) {
            return Store {
                inner: Arc::clone(existing),
            };
        }

        let inner = Arc::new(StoreInner {
            key: key.to_string(),
            state: Mutex::new(StoreState {
                value: value.clone(),
                initial: value.clone(),
                subs: HashMap::new(),
            }),
            factory: Arc::downgrade(&self.inner),
        });
        stores.insert(key.to_string(), Arc::clone(&inner));

        // Fire while still holding the map lock: a concurrent set() on the
        // new store must not observably precede its creation.
        let create_subs = self.inner.create_subs.lock().unwrap_or_else(|e| e.into_inner());
        for sub in create_subs.values() {
            sub(key, &value);
        }
        drop(create_subs);

        Store { inner }
    }

    pub fn get(&self, key: &str) -> Option<Store> {
        self.inner
            .stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|inner| Store {
                inner: Arc::clone(inner),
            })
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner
            .stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Remove a store entirely. Returns its last value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner
            .stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|inner| {
                inner
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .value
                    .clone()
            })
    }

    /// Consistent key→value view of every store.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let stores = self.inner.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .iter()
            .map(|(key, inner)| {
                let value = inner
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .value
                    .clone();
                (key.clone(), value)
            })
            .collect()
    }

    pub fn subscribe_create<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_global(&self.inner.create_subs, callback)
    }

    pub fn subscribe_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_global(&self.inner.change_subs, callback)
    }

    fn subscribe_global<F>(&self, map: &Mutex<HashMap<u64, KeyCallback>>, callback: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));

        let inner = Arc::downgrade(&self.inner);
        let which = std::ptr::eq(map, &self.inner.create_subs);
        Subscription(Some(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                let map = if which {
                    &inner.create_subs
                } else {
                    &inner.change_subs
                };
                map.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        })))
    }
}

impl Default for StoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFactory")
            .field("stores", &self.keys())
            .finish()
    }
}
