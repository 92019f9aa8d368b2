// Runtime crate - recordings in, deterministic replays out
// Wraps the kernel with the capture protocol and the event-sourcing layer

mod compare;
mod config;
mod error;
mod recording;
mod replay;
mod session;
mod snapshot;

pub use compare::{compare_scenarios, Comparison, Difference, Significance};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use recording::{RecordingStore, ScenarioRecording};
pub use replay::{replay_scenario, Mismatch, ReplayOptions, ReplayOutcome};
pub use session::SimulationSession;
pub use snapshot::Snapshot;
