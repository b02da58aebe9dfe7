// Evgrab Event Handling
// Readiness multiplexing, shutdown control and the capture loop

pub mod control;
pub mod multiplex;
pub mod orchestrator;
pub mod sink;

pub use control::{ControlChannel, ControlError, ShutdownHandle, TERM_SIGNALS};
pub use multiplex::{MultiplexError, Multiplexer, Token, MAX_EVENTS};
pub use orchestrator::{
    CaptureOptions, Orchestrator, OrchestratorError, OrchestratorState, Termination,
};
pub use sink::EventSink;
