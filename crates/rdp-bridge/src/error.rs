use thiserror::Error;

use rdp_wire::{ActorError, WireError};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Why a coordinated thread operation did not happen.
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("thread is running")]
    ThreadRunning,
    #[error("thread is resuming")]
    ThreadResuming,
    #[error(
        "{thread} can't be resumed because you need to resume {} first",
        .blocking.join(", ")
    )]
    HinderedResume {
        thread: String,
        blocking: Vec<String>,
    },
    #[error("request was pre-empted by a pause of the remote thread")]
    Preempted,
    #[error("thread coordinator shut down")]
    Shutdown,
    #[error(transparent)]
    Actor(#[from] ActorError),
    #[error("{0}")]
    Task(String),
}

impl From<WireError> for CoordinatorError {
    fn from(err: WireError) -> Self {
        CoordinatorError::Actor(err.into())
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Actor(#[from] ActorError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("the debuggee has no tabs to attach to")]
    NoTabs,
}
