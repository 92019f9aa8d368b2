// Engine crate - the simulation kernel and everything it evaluates
// This layer turns a validated scenario plus core events into derived log entries

mod error;
pub mod diagnostics;
pub mod formula;
pub mod fsm;
mod kernel;
mod log;
mod rng;
mod template;

pub use error::{Error, Result};
pub use formula::{evaluate, EvalContext, EvalHooks, NoHooks};
pub use fsm::{
    AiInterpreter, AiRequest, ExternalCall, ExternalDispatcher, FeedbackLimits,
    FeedbackRejection, FsmMessage, NullAiInterpreter, NullDispatcher, RankedInterpretation,
    RawEvent, RecordingDispatcher,
};
pub use kernel::{KernelConfig, KernelState, NodeRuntime, SimulationKernel, TokenMeta};
pub use log::{ActivityLog, EntryDraft};
pub use rng::SimRng;
pub use template::substitute;
