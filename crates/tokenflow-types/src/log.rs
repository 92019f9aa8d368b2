use crate::event::ControlAction;
use crate::scenario::AggregationMethod;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// One row of the global append-only activity log.
///
/// Entries are totally ordered by `(sim_time, sequence)`; `sequence` is
/// assigned at append time and is unique across the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LogEntry {
    pub sim_time: u64,
    pub epoch_ms: i64,
    pub sequence: u64,
    pub node_id: String,
    pub action: LogAction,
    /// The token this entry is about: the one created, moved, dropped or
    /// consumed. Absent on control/system rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Value after the action took effect.
    pub value: serde_json::Value,
    /// Per-source summaries for aggregation/transformation entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tokens: Vec<SourceSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<OperationDetails>,
    /// Coarse operational state of the node when the action happened.
    pub node_state: String,
    /// Input-buffer occupancy at the moment of the action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub buffer_sizes: BTreeMap<String, usize>,
}

impl LogEntry {
    /// Token identifiers this entry derives from.
    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.source_tokens.iter().map(|s| s.id.as_str())
    }
}

/// What happened. Serialized as the upper-snake label the lineage builder
/// matches on (`CREATED`, `AGGREGATED_SUM`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Created,
    Aggregated(AggregationMethod),
    Arrived,
    ConsumedBySinkNode,
    Transferred,
    TimerTick,
    Control(ControlAction),
    /// A user interaction captured alongside the run; augments the log only.
    UserInteraction,
    /// Levelled output of an FSM log action.
    Logged,
    Error,
    Dropped,
    RoutingError,
    FeedbackBlocked,
}

impl LogAction {
    pub fn label(&self) -> String {
        match self {
            LogAction::Created => "CREATED".to_string(),
            LogAction::Aggregated(method) => format!("AGGREGATED_{}", method.label()),
            LogAction::Arrived => "ARRIVED".to_string(),
            LogAction::ConsumedBySinkNode => "CONSUMED_BY_SINK_NODE".to_string(),
            LogAction::Transferred => "TRANSFERRED".to_string(),
            LogAction::TimerTick => "TIMER_TICK".to_string(),
            LogAction::Control(action) => format!("CONTROL_{}", action.label()),
            LogAction::UserInteraction => "USER_INTERACTION".to_string(),
            LogAction::Logged => "LOG".to_string(),
            LogAction::Error => "ERROR".to_string(),
            LogAction::Dropped => "DROPPED".to_string(),
            LogAction::RoutingError => "ROUTING_ERROR".to_string(),
            LogAction::FeedbackBlocked => "FEEDBACK_BLOCKED".to_string(),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        if let Some(suffix) = label.strip_prefix("AGGREGATED_") {
            return AggregationMethod::from_label(suffix).map(LogAction::Aggregated);
        }
        if let Some(suffix) = label.strip_prefix("CONTROL_") {
            return ControlAction::from_label(suffix).map(LogAction::Control);
        }
        match label {
            "CREATED" => Some(LogAction::Created),
            "ARRIVED" => Some(LogAction::Arrived),
            "CONSUMED_BY_SINK_NODE" => Some(LogAction::ConsumedBySinkNode),
            "TRANSFERRED" => Some(LogAction::Transferred),
            "TIMER_TICK" => Some(LogAction::TimerTick),
            "USER_INTERACTION" => Some(LogAction::UserInteraction),
            "LOG" => Some(LogAction::Logged),
            "ERROR" => Some(LogAction::Error),
            "DROPPED" => Some(LogAction::Dropped),
            "ROUTING_ERROR" => Some(LogAction::RoutingError),
            "FEEDBACK_BLOCKED" => Some(LogAction::FeedbackBlocked),
            _ => None,
        }
    }

    /// True for the entries that introduce a new token into the graph.
    pub fn is_creation(&self) -> bool {
        matches!(self, LogAction::Created | LogAction::Aggregated(_))
    }
}

impl Serialize for LogAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for LogAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        LogAction::from_label(&label)
            .ok_or_else(|| de::Error::custom(format!("unknown log action: {}", label)))
    }
}

/// Snapshot of one source token at the moment a derived token was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceSummary {
    pub id: String,
    pub origin_node_id: String,
    pub original_value: serde_json::Value,
    pub created_at: u64,
    pub generation_level: u32,
    /// Root ancestors this source ultimately traces back to.
    pub ultimate_sources: Vec<String>,
}

/// One source's share of an aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceContribution {
    pub token_id: String,
    pub value: serde_json::Value,
    pub weight: f64,
}

/// Operation-specific payload attached to a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationDetails {
    Aggregation {
        method: AggregationMethod,
        contributions: Vec<SourceContribution>,
        /// Human-readable calculation, e.g. `avg(25.5, 26.1) = 25.8`.
        calculation: String,
    },
    Transformation {
        formula: String,
        input_mapping: BTreeMap<String, serde_json::Value>,
        calculation: String,
    },
    Drop {
        capacity: usize,
    },
    RoutingFailure {
        destination: String,
    },
    Feedback {
        depth: u32,
        reason: String,
    },
    Failure {
        message: String,
    },
}
