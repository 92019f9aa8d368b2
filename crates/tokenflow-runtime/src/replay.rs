use crate::recording::ScenarioRecording;
use crate::snapshot::{hash_state, Snapshot};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokenflow_engine::{KernelConfig, KernelState, SimulationKernel};
use tokenflow_types::{ControlAction, CoreEvent, CoreEventKind, LogEntry, Scenario};

/// Applies core events to a kernel. Capture and replay share this type, so
/// whatever a live session did to its kernel, a replay does identically.
pub(crate) struct Executor {
    pub kernel: SimulationKernel,
    pub running: bool,
    initial: Scenario,
    epoch_base: i64,
    config: KernelConfig,
}

impl Executor {
    pub fn new(initial: Scenario, epoch_base: i64, config: KernelConfig) -> Result<Self> {
        let kernel = SimulationKernel::new(initial.clone(), config, epoch_base)?;
        Ok(Self {
            kernel,
            running: false,
            initial,
            epoch_base,
            config,
        })
    }

    pub fn from_state(
        state: KernelState,
        initial: Scenario,
        epoch_base: i64,
        running: bool,
    ) -> Self {
        let config = state.config;
        Self {
            kernel: SimulationKernel::from_state(
                state,
                Box::new(tokenflow_engine::NullDispatcher),
                Box::new(tokenflow_engine::NullAiInterpreter),
            ),
            running,
            initial,
            epoch_base,
            config,
        }
    }

    /// Apply one core event. Injections or upgrades that no longer resolve
    /// against the current model are skipped, never fatal; replay must
    /// always run to completion.
    pub fn apply(&mut self, event: &CoreEvent) -> Result<()> {
        match &event.kind {
            CoreEventKind::SimulationStart => {
                self.running = true;
            }
            CoreEventKind::TimerTick => {
                if self.running {
                    self.kernel.tick();
                }
            }
            CoreEventKind::ManualInjection => {
                let Some(target) = event.target_node.as_deref() else {
                    return Ok(());
                };
                let value = event.payload.get("value").cloned().unwrap_or_default();
                let input = event.payload.get("input").and_then(|v| v.as_str());
                let _ = self.kernel.inject_token(target, input, value);
            }
            CoreEventKind::ModelUpgrade => {
                if let Some(scenario_value) = event.payload.get("scenario") {
                    if let Ok(scenario) =
                        serde_json::from_value::<Scenario>(scenario_value.clone())
                    {
                        let _ = self.kernel.upgrade_model(scenario);
                    }
                }
            }
            CoreEventKind::ExternalData => {
                if let Some(target) = event.target_node.as_deref() {
                    let _ = self.kernel.external_data(target, event.payload.clone());
                }
            }
            CoreEventKind::UserInteraction { category } => {
                self.kernel
                    .record_user_interaction(category, event.payload.clone());
            }
            CoreEventKind::Control { action } => match action {
                ControlAction::Play => {
                    self.kernel.record_control(ControlAction::Play);
                    self.running = true;
                }
                ControlAction::Pause => {
                    self.kernel.record_control(ControlAction::Pause);
                    self.running = false;
                }
                ControlAction::Step => {
                    self.kernel.record_control(ControlAction::Step);
                    self.kernel.tick();
                }
                ControlAction::Reset => {
                    // Derived state goes; the core-event list stays.
                    self.kernel = SimulationKernel::new(
                        self.initial.clone(),
                        self.config,
                        self.epoch_base,
                    )?;
                    self.kernel.record_control(ControlAction::Reset);
                    self.running = false;
                }
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Replay up to this sim time; `None` replays everything.
    pub until: Option<u64>,
    /// A previously captured snapshot to check the result against.
    pub validate_against: Option<Snapshot>,
}

/// One field that differed from the validation snapshot. Reported as data,
/// never as a panic or an Err.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Mismatch {
    pub field: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub state: KernelState,
    pub validation: Vec<Mismatch>,
}

impl ReplayOutcome {
    pub fn log(&self) -> &[LogEntry] {
        self.state.log.entries()
    }

    pub fn state_hash(&self) -> String {
        hash_state(&self.state)
    }
}

/// Rerun a recording's core events against its initial model.
///
/// Restores from the newest snapshot at or before the target when one is
/// available, then applies the remaining events in order. For the same
/// recording, the derived log is byte-identical run to run.
pub fn replay_scenario(
    recording: &ScenarioRecording,
    options: &ReplayOptions,
) -> Result<ReplayOutcome> {
    let target = options.until.unwrap_or(u64::MAX);

    let (mut executor, skip) = match recording.best_snapshot(target) {
        Some(snapshot) => {
            let skip = snapshot.events_applied;
            if skip > recording.events.len() {
                return Err(Error::Recording(format!(
                    "snapshot claims {} applied events but the recording has {}",
                    skip,
                    recording.events.len()
                )));
            }
            let running = running_after(&recording.events[..skip]);
            (
                Executor::from_state(
                    snapshot.state.clone(),
                    recording.initial.clone(),
                    recording.epoch_base,
                    running,
                ),
                skip,
            )
        }
        None => (
            Executor::new(
                recording.initial.clone(),
                recording.epoch_base,
                recording.kernel_config,
            )?,
            0,
        ),
    };

    for event in &recording.events[skip..] {
        if executor.kernel.sim_time() >= target {
            break;
        }
        executor.apply(event)?;
    }

    let state = executor.kernel.state();
    let mut validation = Vec::new();
    if let Some(expected) = &options.validate_against {
        let actual_hash = hash_state(&state);
        if state.sim_time != expected.sim_time {
            validation.push(Mismatch {
                field: "sim_time".to_string(),
                expected: expected.sim_time.to_string(),
                actual: state.sim_time.to_string(),
            });
        }
        if state.log.len() != expected.log_length {
            validation.push(Mismatch {
                field: "log_length".to_string(),
                expected: expected.log_length.to_string(),
                actual: state.log.len().to_string(),
            });
        }
        if actual_hash != expected.state_hash {
            validation.push(Mismatch {
                field: "state_hash".to_string(),
                expected: expected.state_hash.clone(),
                actual: actual_hash,
            });
        }
    }

    Ok(ReplayOutcome { state, validation })
}

/// Running flag after the given prefix of events, for snapshot resume.
fn running_after(events: &[CoreEvent]) -> bool {
    let mut running = false;
    for event in events {
        match &event.kind {
            CoreEventKind::SimulationStart => running = true,
            CoreEventKind::Control { action } => match action {
                ControlAction::Play => running = true,
                ControlAction::Pause | ControlAction::Reset => running = false,
                ControlAction::Step => {}
            },
            _ => {}
        }
    }
    running
}
