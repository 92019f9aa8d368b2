mod error;
mod event;
mod log;
mod scenario;
mod token;
mod util;

pub use error::{Error, Result};
pub use event::{
    ControlAction, CoreEvent, CoreEventKind, EventMetadata, EVENT_SCHEMA_VERSION,
};
pub use log::{
    LogAction, LogEntry, OperationDetails, SourceContribution, SourceSummary,
};
pub use scenario::{
    ActionOutput, ActionSpec, AggregationMethod, AggregationSpec, DataSourceNode, FsmDefinition,
    FsmProcessNode, Input, InterpretationMethod, InterpretationRule, LogLevel, Node, NodeBase,
    OnErrorPolicy, Output, PortInterface, Position, ProcessNode, QueueNode, Scenario, SinkNode,
    StateActions, Transition, TransitionTrigger, VariableOp, VariableScope, SCENARIO_VERSION,
};
pub use token::Token;
pub use util::{format_number, format_value, truncate_string};
