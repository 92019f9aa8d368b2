//! The enhanced state-machine subsystem embedded in FSM process nodes.
//!
//! An FSM node consumes three input classes each tick: tokens (adapted to
//! synthetic `token_received` events), raw events, and typed messages.
//! Interpretation rules turn events into messages, messages drive
//! transitions, and transitions schedule entry/exit actions whose outputs
//! flow back into the simulation - bounded by the feedback manager.

mod actions;
mod feedback;
mod interpret;
mod machine;

pub use feedback::{FeedbackLimits, FeedbackManager, FeedbackRejection, FeedbackState};
pub use machine::{step, StepCtx, StepOutcome, TransitionFired, TriggerKind};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokenflow_types::{ActionSpec, ActionOutput, FsmDefinition, LogLevel, OnErrorPolicy};

/// Messages buffered beyond this are dropped oldest-first; an unmatched
/// message must not grow the buffer without bound.
pub const MESSAGE_BUFFER_CAP: usize = 256;

/// A raw occurrence delivered to an FSM node: an external feed, a feedback
/// event from an action, or a synthetic `token_received` adaptation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RawEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    /// Kind of the source node (`data_source`, `fsm_process`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Feedback depth; zero for externally-originated events.
    #[serde(default)]
    pub depth: u32,
    pub execution_id: String,
    pub created_at: u64,
}

impl RawEvent {
    /// String projection interpretation rule patterns match against.
    pub fn projection(&self) -> String {
        format!("{} {}", self.event_type, self.payload)
    }
}

/// A typed message produced by event interpretation or routed directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FsmMessage {
    pub id: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Rule and event that produced this message, when interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub depth: u32,
    pub execution_id: String,
    pub created_at: u64,
}

/// An entry/exit action waiting for its delay to elapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PendingAction {
    pub action: ActionSpec,
    pub state: String,
    pub phase: ActionPhase,
    pub execute_at: u64,
    /// Depth and execution id of whatever triggered the transition, so
    /// feedback outputs inherit the chain.
    pub depth: u32,
    pub execution_id: String,
}

/// A single failed output rescheduled under the `retry` policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PendingRetry {
    pub output: ActionOutput,
    pub state: String,
    pub execute_at: u64,
    pub attempts_left: u32,
    /// Next backoff doubles from this.
    pub backoff: u64,
    pub on_error: OnErrorPolicy,
    pub depth: u32,
    pub execution_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Entry,
    Exit,
}

/// Mutable state of one FSM node, serialized into snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FsmRuntime {
    pub current_state: String,
    pub state_changed_at: u64,
    pub variables: BTreeMap<String, Value>,
    /// Per-state variable scopes, created on first write.
    pub state_variables: BTreeMap<String, BTreeMap<String, Value>>,
    pub event_buffer: VecDeque<RawEvent>,
    pub message_buffer: VecDeque<FsmMessage>,
    pub pending_actions: Vec<PendingAction>,
    pub pending_retries: Vec<PendingRetry>,
    /// Mints per-node event/message/execution identifiers.
    pub id_counter: u64,
}

impl FsmRuntime {
    pub fn new(def: &FsmDefinition) -> Self {
        let mut rt = Self {
            current_state: def.initial_state.clone(),
            state_changed_at: 0,
            variables: def.variables.clone(),
            state_variables: BTreeMap::new(),
            event_buffer: VecDeque::new(),
            message_buffer: VecDeque::new(),
            pending_actions: Vec::new(),
            pending_retries: Vec::new(),
            id_counter: 0,
        };
        // The initial state is entered at time zero like any other.
        rt.schedule_actions(def, &def.initial_state, ActionPhase::Entry, 0, 0, "boot");
        rt
    }

    pub fn next_id(&mut self, prefix: &str, node_id: &str) -> String {
        self.id_counter += 1;
        format!("{}_{}_{}", prefix, node_id, self.id_counter)
    }

    pub fn push_event(&mut self, event: RawEvent) {
        self.event_buffer.push_back(event);
    }

    pub fn push_message(&mut self, message: FsmMessage) {
        if self.message_buffer.len() >= MESSAGE_BUFFER_CAP {
            self.message_buffer.pop_front();
        }
        self.message_buffer.push_back(message);
    }

    pub fn schedule_actions(
        &mut self,
        def: &FsmDefinition,
        state: &str,
        phase: ActionPhase,
        now: u64,
        depth: u32,
        execution_id: &str,
    ) {
        let Some(actions) = def.state_actions.get(state) else {
            return;
        };
        let specs = match phase {
            ActionPhase::Entry => &actions.on_entry,
            ActionPhase::Exit => &actions.on_exit,
        };
        for spec in specs {
            self.pending_actions.push(PendingAction {
                action: spec.clone(),
                state: state.to_string(),
                phase,
                execute_at: now + spec.delay,
                depth,
                execution_id: execution_id.to_string(),
            });
        }
    }

    /// Variables of the current state's scope, if any were written.
    pub fn current_state_variables(&self) -> BTreeMap<String, Value> {
        self.state_variables
            .get(&self.current_state)
            .cloned()
            .unwrap_or_default()
    }
}

/// What a step asks the kernel to do on its behalf. Token routing, feedback
/// admission and log appends all live kernel-side; the machine itself only
/// mutates its own runtime.
#[derive(Debug, Clone)]
pub enum FsmEffect {
    EmitToken {
        output_name: String,
        value: Value,
    },
    /// `target == None` routes back to the emitting node.
    EmitEvent {
        target: Option<String>,
        event: RawEvent,
    },
    EmitMessage {
        target: Option<String>,
        message: FsmMessage,
    },
    External(ExternalCall),
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Side effects leaving the simulation entirely, issued submit-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExternalCall {
    Api {
        url: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Email {
        to: String,
        subject: String,
        body: String,
    },
}

/// Transport for external calls; the engine never blocks on a response.
/// A response, if any, re-enters later as a core event.
pub trait ExternalDispatcher {
    fn submit(&mut self, node_id: &str, call: ExternalCall);
}

/// Discards every call. The default for pure simulation runs and tests.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl ExternalDispatcher for NullDispatcher {
    fn submit(&mut self, _node_id: &str, _call: ExternalCall) {}
}

/// Collects calls for assertion in tests.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub calls: Vec<(String, ExternalCall)>,
}

impl ExternalDispatcher for RecordingDispatcher {
    fn submit(&mut self, node_id: &str, call: ExternalCall) {
        self.calls.push((node_id.to_string(), call));
    }
}

/// Request handed to the external AI interpretation collaborator.
#[derive(Debug)]
pub struct AiRequest<'a> {
    pub prompt: &'a str,
    pub event: &'a RawEvent,
    pub candidate_message_types: &'a [String],
}

#[derive(Debug, Clone)]
pub struct RankedInterpretation {
    pub message_type: String,
    pub payload: Value,
    pub confidence: f64,
}

pub trait AiInterpreter {
    /// Ranked candidate interpretations, best first.
    fn interpret(&mut self, request: AiRequest<'_>) -> Vec<RankedInterpretation>;
}

/// Returns no interpretations, so `ai` rules never match. The default.
#[derive(Debug, Default)]
pub struct NullAiInterpreter;

impl AiInterpreter for NullAiInterpreter {
    fn interpret(&mut self, _request: AiRequest<'_>) -> Vec<RankedInterpretation> {
        Vec::new()
    }
}
