//! Typed proxies for the remote actors a debugger talks to.
//!
//! Each proxy owns a FIFO of pending continuations and one broadcast channel
//! per event kind it can emit. A packet whose `type` is not one of the actor's
//! reply types is an event, even while a request is pending.

/// Implements the [`ActorProxy`](crate::ActorProxy) boilerplate for a proxy
/// with `name` and `pending: PendingRequests` fields whose replies are all
/// untyped and that emits no events.
macro_rules! reply_only_actor {
    ($proxy:ty) => {
        impl $crate::actor::ActorProxy for $proxy {
            fn name(&self) -> &str {
                &self.name
            }

            fn receive_response(&self, packet: serde_json::Value) {
                if let Some(kind) = $crate::actor::packet_type(&packet) {
                    tracing::warn!(
                        target: "rdp.wire",
                        actor = %self.name,
                        kind,
                        "ignoring unexpected event"
                    );
                    return;
                }
                self.pending.settle(&self.name, packet);
            }

            fn connection_closed(&self) {
                self.pending
                    .reject_all($crate::types::ActorError::connection_closed());
            }

            fn into_any(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }
    };
}

pub mod breakpoint;
pub mod console;
pub mod object;
pub mod root;
pub mod source;
pub mod tab;
pub mod thread;

pub use breakpoint::BreakpointActorProxy;
pub use console::ConsoleActorProxy;
pub use object::ObjectActorProxy;
pub use root::RootActorProxy;
pub use source::{BreakpointPositions, SetBreakpointReply, SourceActorProxy};
pub use tab::{TabActorProxy, TabNavigated};
pub use thread::{ExecutionEvent, ThreadActorProxy, ThreadExited};
