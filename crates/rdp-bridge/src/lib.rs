//! Coordination layer of the remote debugging bridge.
//!
//! This crate provides:
//! - A per-thread state machine serializing interrupt, resume, evaluate and
//!   paused-thread work against a remote thread.
//! - A process-wide arbiter deciding which thread may pause or resume next.
//! - Breakpoint reconciliation: converging installed breakpoints to the set
//!   the client asked for, per loaded source.

pub mod breakpoints;
pub mod error;
pub mod pause_coordinator;
pub mod remote_breakpoints;
pub mod remote_thread;
pub mod session;
pub mod source_sync;
pub mod thread_coordinator;

pub use crate::breakpoints::{
    resolve_position, BreakpointChanged, BreakpointInfo, BreakpointSink, BreakpointsManager,
    HitCondition, SourceBreakpoint, Verification, Verifier,
};
pub use crate::error::{BridgeError, CoordinatorError, CoordinatorResult};
pub use crate::pause_coordinator::{PauseRecord, PauseType, Permit, ThreadId, ThreadPauseCoordinator};
pub use crate::remote_breakpoints::{
    BreakpointProtocol, RemoteBackend, RemoteHandle, SourceKind, SourceMapQuery,
};
pub use crate::remote_thread::RemoteThread;
pub use crate::session::Bridge;
pub use crate::source_sync::{BreakpointBackend, SourceBreakpoints};
pub use crate::thread_coordinator::{BoxFuture, Cleanup, ThreadControl, ThreadCoordinator, ThreadState};
