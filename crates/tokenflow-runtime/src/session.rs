use crate::config::RuntimeConfig;
use crate::recording::ScenarioRecording;
use crate::replay::Executor;
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use serde_json::Value;
use tokenflow_engine::diagnostics::{self, ValidatorOptions};
use tokenflow_engine::SimulationKernel;
use tokenflow_lineage::LineageEngine;
use tokenflow_types::{
    ControlAction, CoreEvent, CoreEventKind, EventMetadata, Scenario, EVENT_SCHEMA_VERSION,
};
use uuid::Uuid;

/// A live capture session: every call on the protocol surface appends
/// exactly one core event to the recording and applies it to the kernel
/// through the same executor a replay uses.
pub struct SimulationSession {
    session_id: Uuid,
    executor: Executor,
    recording: ScenarioRecording,
    config: RuntimeConfig,
    next_sequence: u64,
}

impl SimulationSession {
    /// Validate the scenario and open a recording. Appends the
    /// `simulation_start` event.
    pub fn start(scenario: Scenario, config: RuntimeConfig) -> Result<Self> {
        let issues = diagnostics::validate(
            &scenario,
            &ValidatorOptions {
                strict_input_reachability: config.strict_input_reachability,
            },
        );
        if !diagnostics::is_valid(&issues) {
            return Err(Error::Engine(tokenflow_engine::Error::Validation(issues)));
        }

        let epoch_base = chrono::Utc::now().timestamp_millis();
        let kernel_config = config.kernel();
        let mut session = Self {
            session_id: Uuid::new_v4(),
            executor: Executor::new(scenario.clone(), epoch_base, kernel_config)?,
            recording: ScenarioRecording::new(scenario, epoch_base, kernel_config),
            config,
            next_sequence: 0,
        };
        session.capture(CoreEventKind::SimulationStart, None, Value::Null)?;
        Ok(session)
    }

    fn capture(
        &mut self,
        kind: CoreEventKind,
        target_node: Option<String>,
        payload: Value,
    ) -> Result<()> {
        let event = CoreEvent {
            id: Uuid::new_v4(),
            sim_time: self.executor.kernel.sim_time(),
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            target_node,
            payload,
            metadata: EventMetadata {
                session_id: self.session_id,
                sequence: self.next_sequence,
                schema_version: EVENT_SCHEMA_VERSION.to_string(),
                caused_by: None,
            },
        };
        self.next_sequence += 1;
        self.executor.apply(&event)?;
        self.recording.events.push(event);
        Ok(())
    }

    /// One timer tick, captured as a core event. A paused session ignores
    /// the timer and captures nothing.
    pub fn tick(&mut self) -> Result<bool> {
        if !self.executor.running {
            return Ok(false);
        }
        self.capture(CoreEventKind::TimerTick, None, Value::Null)?;
        Ok(true)
    }

    pub fn run_ticks(&mut self, ticks: u64) -> Result<()> {
        for _ in 0..ticks {
            if !self.tick()? {
                break;
            }
        }
        Ok(())
    }

    pub fn play(&mut self) -> Result<()> {
        self.control(ControlAction::Play)
    }

    pub fn pause(&mut self) -> Result<()> {
        self.control(ControlAction::Pause)
    }

    /// Advance exactly one tick regardless of the running state.
    pub fn step(&mut self) -> Result<()> {
        self.control(ControlAction::Step)
    }

    /// Discard derived state; the recording keeps every core event.
    pub fn reset(&mut self) -> Result<()> {
        self.control(ControlAction::Reset)
    }

    fn control(&mut self, action: ControlAction) -> Result<()> {
        self.capture(CoreEventKind::Control { action }, None, Value::Null)
    }

    /// Materialize a token owned by node `user` into the named node.
    pub fn inject_token(&mut self, node_id: &str, value: Value) -> Result<()> {
        let node = self
            .executor
            .kernel
            .scenario()
            .node(node_id)
            .ok_or_else(|| Error::InvalidOperation(format!("unknown node `{}`", node_id)))?;
        if node.inputs().is_empty() {
            return Err(Error::InvalidOperation(format!(
                "node `{}` has no inputs to inject into",
                node_id
            )));
        }
        self.capture(
            CoreEventKind::ManualInjection,
            Some(node_id.to_string()),
            serde_json::json!({ "value": value }),
        )
    }

    /// Swap node definitions at the tick boundary.
    pub fn upgrade_model(&mut self, scenario: Scenario, reason: &str) -> Result<()> {
        let issues = diagnostics::validate(
            &scenario,
            &ValidatorOptions {
                strict_input_reachability: self.config.strict_input_reachability,
            },
        );
        if !diagnostics::is_valid(&issues) {
            return Err(Error::Engine(tokenflow_engine::Error::Validation(issues)));
        }
        let scenario_value = serde_json::to_value(&scenario)
            .map_err(|e| Error::Recording(format!("unencodable scenario: {}", e)))?;
        self.capture(
            CoreEventKind::ModelUpgrade,
            None,
            serde_json::json!({ "scenario": scenario_value, "reason": reason }),
        )
    }

    pub fn external_data(&mut self, node_id: &str, payload: Value) -> Result<()> {
        if self.executor.kernel.scenario().node(node_id).is_none() {
            return Err(Error::InvalidOperation(format!("unknown node `{}`", node_id)));
        }
        self.capture(CoreEventKind::ExternalData, Some(node_id.to_string()), payload)
    }

    pub fn user_interaction(&mut self, category: &str, payload: Value) -> Result<()> {
        self.capture(
            CoreEventKind::UserInteraction {
                category: category.to_string(),
            },
            None,
            payload,
        )
    }

    /// Capture a snapshot of the current state into the recording.
    pub fn take_snapshot(&mut self) -> &Snapshot {
        let snapshot = Snapshot::capture(
            &self.executor.kernel,
            self.recording.events.len(),
            chrono::Utc::now().timestamp_millis(),
        );
        self.recording.snapshots.push(snapshot);
        self.recording.snapshots.last().expect("just pushed")
    }

    pub fn is_running(&self) -> bool {
        self.executor.running
    }

    pub fn kernel(&self) -> &SimulationKernel {
        &self.executor.kernel
    }

    pub fn log(&self) -> &[tokenflow_types::LogEntry] {
        self.executor.kernel.log()
    }

    pub fn recording(&self) -> &ScenarioRecording {
        &self.recording
    }

    pub fn into_recording(self) -> ScenarioRecording {
        self.recording
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// A lineage engine over the current log snapshot.
    pub fn lineage_engine(&self) -> LineageEngine {
        LineageEngine::with_config(self.executor.kernel.log(), self.config.lineage())
    }
}
