pub mod engine;
pub mod wait;

use thiserror::Error;

use crate::mqtt::PublishError;

pub use engine::{SyncEngine, TransitionEvent};

/// Lifecycle of a synchronization session. `Running` is the only phase in
/// which commands and state queries succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Connecting,
    Connected,
    Running,
    Stopped,
    Failed,
}

/// Outcome of a successful `send_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Published, no confirmation requested.
    Sent,
    /// Published and the device reported the target state in time.
    Confirmed,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command {0:?}")]
    InvalidCommand(String),

    #[error("no active broker session")]
    NotConnected,

    #[error(transparent)]
    PublishFailed(#[from] PublishError),

    /// The command was published, but the device never reported the target
    /// state inside the confirmation budget.
    #[error("command sent but the state change was not observed in time")]
    ConfirmationTimeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("no active broker session")]
    NotConnected,

    #[error("no state received from the device")]
    Timeout,
}
