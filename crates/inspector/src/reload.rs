use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fortistate_store::{DEFAULT_CONFIG_FILES, LoadOutcome};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::web::AppState;

/// Stability window before a file change triggers a refresh.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

struct RefreshQueue {
    busy: bool,
    /// One queued follow-up regardless of how many triggers landed; the
    /// latest reason wins.
    queued: Option<String>,
}

struct WatcherState {
    watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

/// Serializes config refreshes and owns the filesystem watcher.
pub struct ReloadControl {
    queue: Mutex<RefreshQueue>,
    watcher: Mutex<Option<WatcherState>>,
    /// Current watch targets, kept for event relevance checks even when a
    /// target does not exist yet.
    targets: Mutex<Vec<(PathBuf, RecursiveMode)>>,
}

impl ReloadControl {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(RefreshQueue {
                busy: false,
                queued: None,
            }),
            watcher: Mutex::new(None),
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Tear down the watcher; pending refreshes short-circuit on the
    /// process shutdown flag.
    pub fn stop(&self) {
        self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn rewatch(&self, targets: Vec<(PathBuf, RecursiveMode)>) {
        let mut guard = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = guard.as_mut() {
            for path in state.watched.drain(..) {
                let _ = state.watcher.unwatch(&path);
            }
            for (path, mode) in &targets {
                if path.exists() {
                    match state.watcher.watch(path, *mode) {
                        Ok(()) => state.watched.push(path.clone()),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), "Failed to watch: {e}")
                        }
                    }
                }
            }
        }
        *self.targets.lock().unwrap_or_else(|e| e.into_inner()) = targets;
    }

    fn is_relevant(&self, event: &Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        event.paths.iter().any(|path| {
            let by_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| DEFAULT_CONFIG_FILES.contains(&name));
            let by_target = targets.iter().any(|(target, mode)| match mode {
                RecursiveMode::NonRecursive => path == target,
                RecursiveMode::Recursive => {
                    path.starts_with(target)
                        && path
                            .extension()
                            .and_then(|e| e.to_str())
                            .is_some_and(|ext| ext == "toml" || ext == "json")
                }
            });
            by_name || by_target
        })
    }
}

impl Default for ReloadControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a config refresh now, or queue one if a refresh is already in flight.
/// Concurrent triggers collapse into a single follow-up run.
pub fn refresh(state: &Arc<AppState>, reason: &str) {
    let mut reason = reason.to_string();
    {
        let mut queue = state
            .reload
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if queue.busy {
            queue.queued = Some(reason);
            return;
        }
        queue.busy = true;
    }

    loop {
        if state.shutting_down.load(Ordering::SeqCst) {
            let mut queue = state
                .reload
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queue.busy = false;
            queue.queued = None;
            return;
        }
        run_once(state, &reason);

        let mut queue = state
            .reload
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match queue.queued.take() {
            Some(next) => reason = next,
            None => {
                queue.busy = false;
                return;
            }
        }
    }
}

fn run_once(state: &Arc<AppState>, reason: &str) {
    tracing::info!(reason, "Refreshing plugin/preset config");
    let outcome = match state.loader.load(&state.config.root) {
        Ok(outcome) => outcome,
        Err(e) => {
            // Previously registered plugin-owned keys stay live until a
            // successful refresh supersedes them.
            tracing::warn!("Config refresh failed, keeping previous stores: {e}");
            return;
        }
    };
    if outcome.loaded > 0 {
        tracing::info!(
            loaded = outcome.loaded,
            config = %outcome
                .config_path
                .as_deref()
                .unwrap_or(Path::new("-"))
                .display(),
            "Loaded plugin/preset config"
        );
    }

    apply_plugin_stores(state, state.loader.registered());
    state
        .reload
        .rewatch(compute_watch_targets(&state.config.root, &outcome));
}

/// Reconcile the registered plugin-store set against the previous one,
/// with effects identical to remote mutations.
pub fn apply_plugin_stores(state: &Arc<AppState>, registered: BTreeMap<String, Value>) {
    let previous = state.remote.plugin_owned_keys();

    for key in previous.iter().filter(|k| !registered.contains_key(*k)) {
        state.remote.delete(key);
        state.factory.remove(key);
        state.hub.store_change(key, Value::Null);
        tracing::debug!(key = %key, "Plugin store removed");
    }

    for (key, initial) in registered {
        let created = !state.factory.has(&key);
        if created {
            // The factory's create subscription broadcasts `store:create`.
            state.factory.create(&key, initial.clone());
        }
        let live = state
            .factory
            .get(&key)
            .map(|s| s.get())
            .unwrap_or(initial);
        state.remote.set(&key, live.clone());
        state.remote.set_plugin_owned(&key, true);
        if !created {
            state.hub.store_change(&key, live);
        }
    }
    state.remote.persist();
}

/// The resolved config path (or the default filenames under root when none
/// resolved) plus every string entry in `presets[]` and `plugins[]`.
fn compute_watch_targets(root: &Path, outcome: &LoadOutcome) -> Vec<(PathBuf, RecursiveMode)> {
    let mut targets = vec![(root.to_path_buf(), RecursiveMode::NonRecursive)];
    match &outcome.config_path {
        Some(path) => targets.push((path.clone(), RecursiveMode::NonRecursive)),
        None => {
            for name in DEFAULT_CONFIG_FILES {
                targets.push((root.join(name), RecursiveMode::NonRecursive));
            }
        }
    }
    if let Some(config) = &outcome.config {
        for entry in config.presets.iter().chain(config.plugins.iter()) {
            if let Value::String(rel) = entry {
                let path = root.join(rel);
                let mode = if path.is_dir() {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                targets.push((path, mode));
            }
        }
    }
    targets
}

/// Start the config file watcher. Disabled by env flag, or for the rest of
/// the process if the watcher backend fails to initialize.
pub fn spawn_watcher(state: Arc<AppState>) {
    if state.config.disable_config_watch {
        tracing::info!("Config watching disabled (FORTISTATE_DISABLE_CONFIG_WATCH)");
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    );
    let watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("Filesystem watcher unavailable, config watching disabled: {e}");
            return;
        }
    };

    {
        let mut guard = state
            .reload
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(WatcherState {
            watcher,
            watched: Vec::new(),
        });
    }
    let targets = state
        .reload
        .targets
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    state.reload.rewatch(targets);

    tokio::spawn(watch_loop(state, rx));
}

async fn watch_loop(state: Arc<AppState>, mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>) {
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut reason = String::new();

    loop {
        if state.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                refresh(&state, &reason);
            }
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if state.reload.is_relevant(&event) {
                            if let Some(path) = event.paths.first() {
                                reason = path.display().to_string();
                            }
                            deadline = Some(tokio::time::Instant::now() + WATCH_DEBOUNCE);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Filesystem watcher error: {e}");
                    }
                    None => {
                        tracing::debug!("Watcher channel closed, stopping watch loop");
                        return;
                    }
                }
            }
        }
    }
}
