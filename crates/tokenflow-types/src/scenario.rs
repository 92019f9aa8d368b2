use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The only scenario schema version this build accepts.
///
/// Version 1.x documents used an older overlapping node vocabulary and are
/// rejected at parse time rather than silently migrated.
pub const SCENARIO_VERSION: &str = "3.0";

/// A complete simulation model: a seed and a set of typed, connected nodes.
///
/// The seed drives every random draw made during a run, which is what makes
/// recordings replayable without storing generated values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub version: String,
    pub seed: u64,
    pub nodes: Vec<Node>,
}

impl Scenario {
    pub fn new(seed: u64, nodes: Vec<Node>) -> Self {
        Self {
            version: SCENARIO_VERSION.to_string(),
            seed,
            nodes,
        }
    }

    /// Parse a persisted scenario document, rejecting unsupported versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(json)?;
        if scenario.version != SCENARIO_VERSION {
            return Err(Error::UnsupportedVersion(scenario.version));
        }
        Ok(scenario)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id())
    }
}

/// Fields shared by every node kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBase {
    pub node_id: String,
    pub display_name: String,
    pub position: Position,
}

/// Canvas position, carried through for the editor surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A scenario node. The `type` tag discriminates the five kinds; processing
/// sites match exhaustively so adding a kind is a compile-time event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Node {
    DataSource(DataSourceNode),
    Queue(QueueNode),
    ProcessNode(ProcessNode),
    FsmProcessNode(FsmProcessNode),
    Sink(SinkNode),
}

impl Node {
    pub fn base(&self) -> &NodeBase {
        match self {
            Node::DataSource(n) => &n.base,
            Node::Queue(n) => &n.base,
            Node::ProcessNode(n) => &n.base,
            Node::FsmProcessNode(n) => &n.base,
            Node::Sink(n) => &n.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().node_id
    }

    pub fn display_name(&self) -> &str {
        &self.base().display_name
    }

    /// Stable kind name, used in log entries and event source matching.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::DataSource(_) => "data_source",
            Node::Queue(_) => "queue",
            Node::ProcessNode(_) => "process",
            Node::FsmProcessNode(_) => "fsm_process",
            Node::Sink(_) => "sink",
        }
    }

    pub fn inputs(&self) -> &[Input] {
        match self {
            Node::DataSource(_) => &[],
            Node::Queue(n) => &n.inputs,
            Node::ProcessNode(n) => &n.inputs,
            Node::FsmProcessNode(n) => &n.inputs,
            Node::Sink(n) => &n.inputs,
        }
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            Node::DataSource(n) => &n.outputs,
            Node::Queue(n) => &n.outputs,
            Node::ProcessNode(n) => &n.outputs,
            Node::FsmProcessNode(n) => &n.fsm.outputs,
            Node::Sink(_) => &[],
        }
    }
}

/// Emits a fresh token every `emission_interval` ticks with a value drawn
/// uniformly from `[value_min, value_max]` by the scenario-seeded PRNG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceNode {
    #[serde(flatten)]
    pub base: NodeBase,
    pub emission_interval: u64,
    pub value_min: f64,
    pub value_max: f64,
    pub outputs: Vec<Output>,
}

/// Buffers inbound tokens and aggregates the accumulated window on a timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueNode {
    #[serde(flatten)]
    pub base: NodeBase,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub aggregation: AggregationSpec,
    /// Tokens that would grow the window past this are dropped and logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSpec {
    pub method: AggregationMethod,
    /// Ticks between aggregations.
    pub trigger_window: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    Average,
    Count,
    First,
    Last,
}

impl AggregationMethod {
    /// Upper-snake label used as the `AGGREGATED_*` action suffix.
    pub fn label(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "SUM",
            AggregationMethod::Average => "AVERAGE",
            AggregationMethod::Count => "COUNT",
            AggregationMethod::First => "FIRST",
            AggregationMethod::Last => "LAST",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "SUM" => Some(AggregationMethod::Sum),
            "AVERAGE" => Some(AggregationMethod::Average),
            "COUNT" => Some(AggregationMethod::Count),
            "FIRST" => Some(AggregationMethod::First),
            "LAST" => Some(AggregationMethod::Last),
            _ => None,
        }
    }
}

/// Waits for one token on every input, then evaluates each output formula
/// over the input mapping and emits one token per output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessNode {
    #[serde(flatten)]
    pub base: NodeBase,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

/// A process node driven by an embedded finite-state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmProcessNode {
    #[serde(flatten)]
    pub base: NodeBase,
    pub inputs: Vec<Input>,
    pub fsm: FsmDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkNode {
    #[serde(flatten)]
    pub base: NodeBase,
    pub inputs: Vec<Input>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub name: String,
    pub interface: PortInterface,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub name: String,
    pub interface: PortInterface,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_input_name: Option<String>,
    /// Present on process-node outputs; evaluated over the input mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl Output {
    pub fn destination(&self) -> Option<(&str, &str)> {
        match (&self.destination_node_id, &self.destination_input_name) {
            (Some(node), Some(input)) => Some((node.as_str(), input.as_str())),
            _ => None,
        }
    }
}

/// Typed port contract: a kind name plus the fields a payload must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInterface {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// The full state machine owned by an [`FsmProcessNode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmDefinition {
    pub states: Vec<String>,
    pub initial_state: String,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Entry/exit actions keyed by state name.
    #[serde(default)]
    pub state_actions: BTreeMap<String, StateActions>,
    /// Rules turning raw events into typed messages, highest priority first.
    #[serde(default)]
    pub interpretation_rules: Vec<InterpretationRule>,
    /// Declared outputs the machine's token actions can route through.
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// Matches raw events and produces typed messages for the state machine.
///
/// A rule matches when every present filter holds: event type, source node
/// kind, a regex over the event's string projection, and payload field
/// equality conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationRule {
    pub id: String,
    /// Rules are evaluated in descending priority; first match wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub metadata_conditions: BTreeMap<String, serde_json::Value>,
    pub method: InterpretationMethod,
}

/// How a matching rule builds messages from the raw event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterpretationMethod {
    /// Regex capture groups mapped into payload fields. Values reference
    /// either a named group (`name`) or a positional one (`1`, `2`, ...).
    #[serde(rename_all = "camelCase")]
    Pattern {
        message_type: String,
        pattern: String,
        #[serde(default)]
        capture_mapping: BTreeMap<String, String>,
    },
    /// A formula producing the payload object.
    #[serde(rename_all = "camelCase")]
    Formula {
        message_type: String,
        formula: String,
    },
    /// Opaque external interpretation; rejected below the threshold.
    #[serde(rename_all = "camelCase")]
    Ai {
        prompt: String,
        candidate_message_types: Vec<String>,
        confidence_threshold: f64,
    },
    /// Evaluator-sandboxed user expression returning
    /// `{messageType, payload}`.
    Script { script: String },
    /// Copy the raw payload, optionally renaming fields
    /// (target field -> source field).
    #[serde(rename_all = "camelCase")]
    Passthrough {
        message_type: String,
        #[serde(default)]
        field_mapping: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub trigger: TransitionTrigger,
    /// Formula over variables, message and buffers; must evaluate truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionTrigger {
    /// Fires on a buffered message of the given type.
    #[serde(rename_all = "camelCase")]
    Message { message_type: String },
    /// Fires when the formula becomes true.
    Condition { formula: String },
    /// Fires `timeout` ticks after the state was entered.
    Timer { timeout: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateActions {
    #[serde(default)]
    pub on_entry: Vec<ActionSpec>,
    #[serde(default)]
    pub on_exit: Vec<ActionSpec>,
}

/// One schedulable action: a condition gate, an optional delay, an error
/// policy, and the outputs it produces when run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Ticks to wait after scheduling before the outputs run.
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    #[serde(default)]
    pub retry_count: u32,
    pub outputs: Vec<ActionOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    #[default]
    Continue,
    Stop,
    Retry,
}

/// One output of an action. Templates (`{{path}}`) are substituted against
/// the node's variable/state context before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutput {
    /// Evaluate `formula` and route the result through a declared output.
    #[serde(rename_all = "camelCase")]
    Token {
        output_name: String,
        formula: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Emit a raw event to self (no target) or a named node.
    #[serde(rename_all = "camelCase")]
    Event {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Emit a typed message to self (no target) or a named node.
    #[serde(rename_all = "camelCase")]
    Message {
        message_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Fire-and-forget HTTP call; response fields may map into variables.
    #[serde(rename_all = "camelCase")]
    ApiCall {
        url: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default)]
        response_mapping: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    Email {
        to: String,
        subject: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Mutate a global or state-scoped variable.
    Variable {
        scope: VariableScope,
        name: String,
        operation: VariableOp,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
}

impl ActionOutput {
    pub fn condition(&self) -> Option<&str> {
        match self {
            ActionOutput::Token { condition, .. }
            | ActionOutput::Event { condition, .. }
            | ActionOutput::Message { condition, .. }
            | ActionOutput::ApiCall { condition, .. }
            | ActionOutput::Log { condition, .. }
            | ActionOutput::Email { condition, .. }
            | ActionOutput::Variable { condition, .. } => condition.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Global,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOp {
    Set,
    Increment,
    Append,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(kind: &str) -> PortInterface {
        PortInterface {
            kind: kind.to_string(),
            required_fields: vec!["value".to_string()],
        }
    }

    #[test]
    fn test_scenario_round_trip() {
        let scenario = Scenario::new(
            42,
            vec![
                Node::DataSource(DataSourceNode {
                    base: NodeBase {
                        node_id: "src".to_string(),
                        display_name: "Source".to_string(),
                        position: Position { x: 0.0, y: 0.0 },
                    },
                    emission_interval: 10,
                    value_min: 1.0,
                    value_max: 5.0,
                    outputs: vec![Output {
                        name: "out".to_string(),
                        interface: port("number"),
                        destination_node_id: Some("sink".to_string()),
                        destination_input_name: Some("in".to_string()),
                        formula: None,
                    }],
                }),
                Node::Sink(SinkNode {
                    base: NodeBase {
                        node_id: "sink".to_string(),
                        display_name: "Sink".to_string(),
                        position: Position { x: 100.0, y: 0.0 },
                    },
                    inputs: vec![Input {
                        name: "in".to_string(),
                        interface: port("number"),
                    }],
                }),
            ],
        );

        let json = scenario.to_json().unwrap();
        let parsed = Scenario::from_json(&json).unwrap();
        assert_eq!(parsed.seed, 42);
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.node("src").unwrap().kind(), "data_source");
        assert_eq!(parsed.node("sink").unwrap().inputs().len(), 1);
    }

    #[test]
    fn test_rejects_v1_documents() {
        let json = r#"{"version": "1.0", "seed": 1, "nodes": []}"#;
        let err = Scenario::from_json(json).unwrap_err();
        assert!(matches!(err, crate::Error::UnsupportedVersion(v) if v == "1.0"));
    }

    #[test]
    fn test_node_tag_shape() {
        let json = r#"{
            "type": "Queue",
            "nodeId": "q1",
            "displayName": "Averager",
            "position": {"x": 1.0, "y": 2.0},
            "inputs": [{"name": "in", "interface": {"type": "number", "requiredFields": []}}],
            "outputs": [],
            "aggregation": {"method": "average", "triggerWindow": 200}
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match &node {
            Node::Queue(q) => {
                assert_eq!(q.aggregation.method, AggregationMethod::Average);
                assert_eq!(q.aggregation.trigger_window, 200);
                assert!(q.capacity.is_none());
            }
            other => panic!("expected queue, got {}", other.kind()),
        }
    }

    #[test]
    fn test_aggregation_labels() {
        for method in [
            AggregationMethod::Sum,
            AggregationMethod::Average,
            AggregationMethod::Count,
            AggregationMethod::First,
            AggregationMethod::Last,
        ] {
            assert_eq!(AggregationMethod::from_label(method.label()), Some(method));
        }
        assert_eq!(AggregationMethod::from_label("MEDIAN"), None);
    }
}
