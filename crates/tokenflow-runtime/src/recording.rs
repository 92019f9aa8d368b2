use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use tokenflow_engine::KernelConfig;
use tokenflow_types::{CoreEvent, Scenario};

/// The event-sourcing unit: an initial model plus every externally-
/// originated event, with optional snapshots for fast replay. Core events
/// are the sole replay input; every derived log entry is recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScenarioRecording {
    pub initial: Scenario,
    /// Epoch base derived entries stamp their `epoch_ms` from.
    pub epoch_base: i64,
    /// Kernel tunables in effect at capture; replay must run the same.
    #[serde(default)]
    pub kernel_config: KernelConfig,
    pub events: Vec<CoreEvent>,
    pub snapshots: Vec<Snapshot>,
}

impl ScenarioRecording {
    pub fn new(initial: Scenario, epoch_base: i64, kernel_config: KernelConfig) -> Self {
        Self {
            initial,
            epoch_base,
            kernel_config,
            events: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::Error::Recording(format!("unreadable recording: {}", e)))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Recording(format!("unwritable recording: {}", e)))
    }

    /// Newest snapshot usable to reach `target` sim time.
    pub fn best_snapshot(&self, target: u64) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.sim_time <= target)
            .max_by_key(|s| (s.sim_time, s.events_applied))
    }
}

/// Persistence backend for scenarios and recordings. Implementations
/// (filesystem, database) live outside this crate; the engine only ever
/// sees the contract.
pub trait RecordingStore {
    fn load_scenario(&self, id: &str) -> crate::Result<Scenario>;
    fn save_scenario(&self, id: &str, scenario: &Scenario) -> crate::Result<()>;
    fn load_recording(&self, id: &str) -> crate::Result<ScenarioRecording>;
    fn save_recording(&self, id: &str, recording: &ScenarioRecording) -> crate::Result<()>;
}
