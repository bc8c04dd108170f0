//! Wire-level implementation of the remote debugging protocol.
//!
//! The protocol is a single bidirectional byte stream carrying length-prefixed
//! JSON packets (`<decimal-length>:<json>`). Every packet is addressed to (or
//! sent from) a named *actor*; this crate owns the framing, the per-connection
//! actor registry and typed proxies for the actors a debugger talks to.

pub mod actor;
pub mod actors;
pub mod codec;
mod connection;
pub mod types;

pub use actor::{ActorProxy, PendingRequests};
pub use codec::{encode_frame, FrameDecoder};
pub use connection::{Connection, ConnectionConfig, ConnectionHandle, IdGenerator};
pub use types::{
    ActorError, Evaluation, ExceptionBreakpoints, FrameForm, Greeting, Grip, PausedEvent,
    Result, SourceForm, SourcePosition, StepKind, TabForm, WireError,
};

// Scripted peer for this crate's tests and, via `test-support`, downstream suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
