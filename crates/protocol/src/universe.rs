use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted universe metadata (`<root>/.fortistate-universes/<id>/meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Universe {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
    pub owner_id: String,
    #[serde(default)]
    pub market_tags: Vec<String>,
    pub active_version_id: Option<String>,
    #[serde(default)]
    pub version_ids: Vec<String>,
    /// Derived from each version's `bindings[].providerId`.
    #[serde(default)]
    pub integration_counts: BTreeMap<String, u64>,
    #[serde(default = "default_sensitivity")]
    pub data_sensitivity: String,
}

fn default_sensitivity() -> String {
    "internal".to_string()
}

/// One canvas snapshot (`versions/<versionId>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseVersion {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub created_at: u64,
    pub created_by: String,
    pub canvas_state: CanvasState,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_summary: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    pub nodes: Vec<Value>,
    pub edges: Vec<Value>,
    pub viewport: Value,
}

/// Integration binding; only `providerId` is interpreted, the rest is
/// carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub provider_id: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// 202 response body for a queued universe launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTicket {
    pub launch_id: String,
    pub universe_id: String,
    pub status: String,
}
