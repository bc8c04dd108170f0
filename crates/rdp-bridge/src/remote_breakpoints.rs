//! Breakpoint installation against real source and thread actors.

use std::{future::Future, sync::Arc};

use rdp_config::BreakpointProtocolPreference;
use rdp_wire::{
    actors::{BreakpointActorProxy, BreakpointPositions, SourceActorProxy, ThreadActorProxy},
    ActorError, ActorProxy, ConnectionHandle, Greeting, SourcePosition,
};

use crate::{
    breakpoints::BreakpointInfo,
    error::{CoordinatorError, CoordinatorResult},
    source_sync::BreakpointBackend,
    thread_coordinator::{ThreadControl, ThreadCoordinator},
};

/// Greeting trait advertised by debuggees that accept thread-owned
/// breakpoints.
pub const THREAD_BREAKPOINTS_TRAIT: &str = "breakpointWhileRunning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointProtocol {
    /// `source.setBreakpoint` creating a breakpoint actor; only while paused.
    LegacyBreakpointActor,
    /// `thread.setBreakpoint` / `thread.removeBreakpoint` by location.
    ThreadOwnedBreakpoint,
}

impl BreakpointProtocol {
    /// Chosen once per connection.
    pub fn select(preference: BreakpointProtocolPreference, greeting: &Greeting) -> Self {
        match preference {
            BreakpointProtocolPreference::Legacy => BreakpointProtocol::LegacyBreakpointActor,
            BreakpointProtocolPreference::ThreadOwned => BreakpointProtocol::ThreadOwnedBreakpoint,
            BreakpointProtocolPreference::Auto if greeting.has_trait(THREAD_BREAKPOINTS_TRAIT) => {
                BreakpointProtocol::ThreadOwnedBreakpoint
            }
            BreakpointProtocolPreference::Auto => BreakpointProtocol::LegacyBreakpointActor,
        }
    }

    pub fn needs_paused_thread(self) -> bool {
        self == BreakpointProtocol::LegacyBreakpointActor
    }
}

/// Position translation for sources produced by a source map. Consuming the
/// map itself happens elsewhere.
pub trait SourceMapQuery: Send + Sync + 'static {
    fn original_position(&self, generated: SourcePosition) -> Option<SourcePosition>;

    fn generated_position(&self, original: SourcePosition) -> Option<SourcePosition>;
}

#[derive(Clone)]
pub enum SourceKind {
    Direct,
    SourceMapped(Arc<dyn SourceMapQuery>),
}

impl SourceKind {
    /// Translate generated positions into the coordinates breakpoints are
    /// requested in.
    pub fn requested_positions(&self, generated: BreakpointPositions) -> BreakpointPositions {
        let SourceKind::SourceMapped(map) = self else {
            return generated;
        };
        let mut original = BreakpointPositions::new();
        for (line, columns) in generated {
            for column in columns {
                if let Some(position) = map.original_position(SourcePosition { line, column }) {
                    original.entry(position.line).or_default().push(position.column);
                }
            }
        }
        for columns in original.values_mut() {
            columns.sort_unstable();
            columns.dedup();
        }
        original
    }

    fn to_generated(&self, position: SourcePosition) -> CoordinatorResult<SourcePosition> {
        match self {
            SourceKind::Direct => Ok(position),
            SourceKind::SourceMapped(map) => map.generated_position(position).ok_or_else(|| {
                CoordinatorError::Task(format!(
                    "no generated position for {}:{}",
                    position.line, position.column
                ))
            }),
        }
    }

    fn to_requested(&self, generated: SourcePosition, fallback: SourcePosition) -> SourcePosition {
        match self {
            SourceKind::Direct => generated,
            SourceKind::SourceMapped(map) => map.original_position(generated).unwrap_or(fallback),
        }
    }
}

pub enum RemoteHandle {
    Actor(Arc<BreakpointActorProxy>),
    Location { url: String, position: SourcePosition },
}

pub struct RemoteBackend<C> {
    protocol: BreakpointProtocol,
    kind: SourceKind,
    source: Arc<SourceActorProxy>,
    thread: Arc<ThreadActorProxy>,
    coordinator: ThreadCoordinator<C>,
    conn: ConnectionHandle,
}

impl<C: ThreadControl> RemoteBackend<C> {
    pub fn new(
        protocol: BreakpointProtocol,
        kind: SourceKind,
        source: Arc<SourceActorProxy>,
        thread: Arc<ThreadActorProxy>,
        coordinator: ThreadCoordinator<C>,
        conn: ConnectionHandle,
    ) -> Self {
        Self {
            protocol,
            kind,
            source,
            thread,
            coordinator,
            conn,
        }
    }

    pub fn protocol(&self) -> BreakpointProtocol {
        self.protocol
    }

    fn url(&self) -> CoordinatorResult<String> {
        self.source
            .url()
            .map(str::to_string)
            .ok_or(CoordinatorError::Actor(ActorError::Unavailable("source url")))
    }

    async fn add_legacy(
        &self,
        generated: SourcePosition,
        condition: Option<String>,
        log_value: Option<String>,
    ) -> CoordinatorResult<(RemoteHandle, SourcePosition)> {
        let source = Arc::clone(&self.source);
        let conn = self.conn.clone();
        self.coordinator
            .run_on_paused_thread_with(
                move || async move {
                    let reply = source
                        .set_breakpoint(generated, condition.as_deref(), log_value.as_deref())
                        .await?;
                    let connection = conn.upgrade().ok_or_else(ActorError::connection_closed)?;
                    let actor = connection.get_or_create(&reply.actor, |conn| {
                        BreakpointActorProxy::new(reply.actor.clone(), conn)
                    })?;
                    if reply.is_pending {
                        tracing::debug!(target: "rdp.bridge", actor = %reply.actor, "breakpoint pending");
                    }
                    Ok((
                        RemoteHandle::Actor(actor),
                        reply.actual_location.unwrap_or(generated),
                    ))
                },
                |installed| async move { Ok(installed) },
                false,
            )
            .await
    }

    async fn remove_legacy(&self, actor: Arc<BreakpointActorProxy>) -> CoordinatorResult<()> {
        let conn = self.conn.clone();
        self.coordinator
            .run_on_paused_thread_with(
                move || async move {
                    let result = actor.delete().await;
                    if let Some(connection) = conn.upgrade() {
                        connection.unregister(actor.name());
                    }
                    result.map_err(CoordinatorError::from)
                },
                |()| async move { Ok(()) },
                false,
            )
            .await
    }
}

impl<C: ThreadControl> BreakpointBackend for RemoteBackend<C> {
    type Handle = RemoteHandle;

    fn positions(&self) -> impl Future<Output = CoordinatorResult<BreakpointPositions>> + Send {
        async move {
            let generated = self.source.breakpoint_positions().await?;
            Ok(self.kind.requested_positions(generated))
        }
    }

    fn add(
        &self,
        info: Arc<BreakpointInfo>,
        position: SourcePosition,
    ) -> impl Future<Output = CoordinatorResult<(RemoteHandle, SourcePosition)>> + Send {
        async move {
            let generated = self.kind.to_generated(position)?;
            let requested = info.requested();
            let condition = requested.condition;
            let log_value = requested.log_message;
            let (handle, actual) = match self.protocol {
                BreakpointProtocol::LegacyBreakpointActor => {
                    self.add_legacy(generated, condition, log_value).await?
                }
                BreakpointProtocol::ThreadOwnedBreakpoint => {
                    let url = self.url()?;
                    self.thread
                        .set_breakpoint(&url, generated, condition.as_deref(), log_value.as_deref())
                        .await?;
                    (
                        RemoteHandle::Location {
                            url,
                            position: generated,
                        },
                        generated,
                    )
                }
            };
            Ok((handle, self.kind.to_requested(actual, position)))
        }
    }

    fn remove(&self, handle: RemoteHandle) -> impl Future<Output = CoordinatorResult<()>> + Send {
        async move {
            match handle {
                RemoteHandle::Actor(actor) => self.remove_legacy(actor).await,
                RemoteHandle::Location { url, position } => {
                    self.thread.remove_breakpoint(&url, position).await?;
                    Ok(())
                }
            }
        }
    }
}
