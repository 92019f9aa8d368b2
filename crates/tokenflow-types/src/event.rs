use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version stamped on every captured core event.
pub const EVENT_SCHEMA_VERSION: &str = "tokenflow.event.v3";

/// An externally-originated occurrence. Core events are the sole input to
/// deterministic replay; everything else in the log is derived from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoreEvent {
    pub id: Uuid,
    pub sim_time: u64,
    /// Wall-clock capture time. Informational only; replay never reads it.
    pub epoch_ms: i64,
    pub kind: CoreEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventMetadata {
    pub session_id: Uuid,
    /// Monotonic per-recording sequence.
    pub sequence: u64,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEventKind {
    SimulationStart,
    TimerTick,
    /// A token materialized into a named node, owned by node `user`.
    ManualInjection,
    /// Node definitions replaced atomically at the tick boundary.
    ModelUpgrade,
    ExternalData,
    UserInteraction { category: String },
    Control { action: ControlAction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Play,
    Pause,
    Step,
    Reset,
}

impl ControlAction {
    pub fn label(&self) -> &'static str {
        match self {
            ControlAction::Play => "PLAY",
            ControlAction::Pause => "PAUSE",
            ControlAction::Step => "STEP",
            ControlAction::Reset => "RESET",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "PLAY" => Some(ControlAction::Play),
            "PAUSE" => Some(ControlAction::Pause),
            "STEP" => Some(ControlAction::Step),
            "RESET" => Some(ControlAction::Reset),
            _ => None,
        }
    }
}
