use serde::{Deserialize, Serialize};

/// The unit of flow: an identified value moving through the graph.
///
/// The value never changes after creation. `history` records the global-log
/// sequence numbers of entries that touched this token, appended by the
/// kernel while it owns the token; full lineage is always derived from the
/// log itself, never from token state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Token {
    pub id: String,
    pub value: serde_json::Value,
    /// Simulation tick of creation.
    pub created_at: u64,
    pub origin_node_id: String,
    #[serde(default)]
    pub history: Vec<u64>,
}

impl Token {
    pub fn new(
        id: impl Into<String>,
        value: serde_json::Value,
        created_at: u64,
        origin_node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            value,
            created_at,
            origin_node_id: origin_node_id.into(),
            history: Vec::new(),
        }
    }

    /// Numeric view of the value; objects expose a numeric `value` field.
    pub fn as_number(&self) -> Option<f64> {
        match &self.value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::Object(map) => map.get("value").and_then(|v| v.as_f64()),
            _ => None,
        }
    }
}
