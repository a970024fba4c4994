//! Controller/worker message protocol.

pub mod messages;
pub mod state;

pub use messages::{
    ControlMessage, LoadOptions, ProgressData, RunPayload, StatusKind, WorkerEvent,
};
pub use state::{Action, ProtocolState};
