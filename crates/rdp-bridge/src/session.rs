//! Attaching to a debuggee and wiring its actors to the coordinators.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use rdp_config::BridgeConfig;
use rdp_wire::{
    actors::{
        ConsoleActorProxy, ExecutionEvent, RootActorProxy, SourceActorProxy, TabActorProxy,
        TabNavigated, ThreadActorProxy, ThreadExited,
    },
    Connection, ConnectionConfig, ConnectionHandle, Greeting, PausedEvent, SourceForm, TabForm,
    WireError,
};

use crate::{
    breakpoints::{BreakpointChanged, BreakpointInfo, BreakpointsManager, SourceBreakpoint},
    error::BridgeError,
    pause_coordinator::{PauseType, ThreadPauseCoordinator},
    remote_breakpoints::{BreakpointProtocol, RemoteBackend, SourceKind},
    remote_thread::RemoteThread,
    source_sync::SourceBreakpoints,
    thread_coordinator::ThreadCoordinator,
};

type Result<T> = std::result::Result<T, BridgeError>;

/// Wire-level settings derived from the bridge config.
pub fn connection_config(config: &BridgeConfig) -> ConnectionConfig {
    ConnectionConfig {
        greeting_timeout: config.connection.greeting_timeout(),
        event_channel_size: config.connection.event_channel_size,
        ..ConnectionConfig::default()
    }
}

/// Creates breakpoint sinks for sources as the thread reports them.
///
/// Every source is treated as [`SourceKind::Direct`]: the thread is attached
/// with `useSourceMaps`, so the debuggee reports original sources as source
/// actors of their own and translates positions itself.
#[derive(Clone)]
struct SourceLoader {
    conn: ConnectionHandle,
    protocol: BreakpointProtocol,
    thread: Arc<ThreadActorProxy>,
    coordinator: ThreadCoordinator<RemoteThread>,
    breakpoints: Arc<BreakpointsManager>,
    /// Source actor to url.
    loaded: Arc<Mutex<HashMap<String, String>>>,
}

impl SourceLoader {
    fn load(&self, form: SourceForm) -> Result<()> {
        let Some(url) = form.url.clone() else {
            tracing::trace!(target: "rdp.bridge", actor = %form.actor, "skipping source without url");
            return Ok(());
        };
        {
            let mut loaded = self.loaded.lock();
            if loaded.contains_key(&form.actor) {
                return Ok(());
            }
            loaded.insert(form.actor.clone(), url.clone());
        }
        let connection = self.conn.upgrade().ok_or(WireError::ConnectionClosed)?;
        let actor = form.actor.clone();
        let source = connection.get_or_create(&actor, |conn| SourceActorProxy::new(form, conn))?;
        let backend = RemoteBackend::new(
            self.protocol,
            SourceKind::Direct,
            source,
            Arc::clone(&self.thread),
            self.coordinator.clone(),
            self.conn.clone(),
        );
        tracing::debug!(target: "rdp.bridge", %url, %actor, "source loaded");
        self.breakpoints.on_new_source(Arc::new(SourceBreakpoints::new(
            url,
            backend,
            self.breakpoints.verifier(),
        )));
        Ok(())
    }

    fn clear(&self) {
        self.loaded.lock().clear();
        self.breakpoints.clear_sources();
    }

    /// Count a breakpoint pause against the hit conditions of the breakpoints
    /// at its location. `false` means none of them wants to stop yet.
    fn should_stop(&self, paused: &PausedEvent) -> bool {
        if paused.why != "breakpoint" {
            return true;
        }
        let Some(location) = paused.frame.as_ref().and_then(|frame| frame.location.as_ref()) else {
            return true;
        };
        let url = location
            .actor
            .as_ref()
            .and_then(|actor| self.loaded.lock().get(actor).cloned());
        let Some(url) = url else {
            return true;
        };
        let hit = self.breakpoints.breakpoints_at(&url, location.line);
        if hit.is_empty() {
            return true;
        }
        // Every breakpoint at the location counts the hit.
        hit.iter().fold(false, |stop, info| info.register_hit() || stop)
    }
}

/// One attached debuggee: the connection, the first tab's thread and the
/// coordinators driving it.
pub struct Bridge {
    connection: Connection,
    root: Arc<RootActorProxy>,
    greeting: Greeting,
    protocol: BreakpointProtocol,
    tab: Arc<TabActorProxy>,
    tab_form: TabForm,
    thread: Arc<ThreadActorProxy>,
    coordinator: ThreadCoordinator<RemoteThread>,
    pauses: Arc<ThreadPauseCoordinator>,
    breakpoints: Arc<BreakpointsManager>,
    events: JoinHandle<()>,
}

impl Bridge {
    /// Connect to the configured debuggee and attach to its first tab.
    pub async fn attach(config: &BridgeConfig) -> Result<Self> {
        let addr = resolve(&config.connection.host, config.connection.port).await?;
        tracing::info!(target: "rdp.bridge", %addr, "connecting to debuggee");
        let (connection, root, greeting) =
            Connection::connect(addr, connection_config(config)).await?;
        Self::attach_to(connection, root, greeting, config).await
    }

    /// Attach over an already established connection.
    pub async fn attach_to(
        connection: Connection,
        root: Arc<RootActorProxy>,
        greeting: Greeting,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let protocol = BreakpointProtocol::select(config.breakpoints.protocol, &greeting);
        tracing::debug!(target: "rdp.bridge", ?protocol, "breakpoint protocol selected");

        let tab_form = root
            .list_tabs()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::NoTabs)?;
        let tab_actor = tab_form.actor.clone();
        let tab = connection.get_or_create(&tab_actor, |conn| {
            TabActorProxy::new(tab_actor.clone(), conn)
        })?;
        let thread_actor = tab.attach().await?;
        let thread = connection.get_or_create(&thread_actor, |conn| {
            ThreadActorProxy::new(thread_actor.clone(), conn)
        })?;

        // Subscribe before attaching so nothing the thread reports is missed.
        let execution = thread.subscribe_execution();
        let new_sources = thread.subscribe_new_source();
        let exited = thread.subscribe_exited();
        let navigated = tab.subscribe_navigated();

        let attached = thread.attach(json!({"useSourceMaps": true})).await?;
        tracing::info!(
            target: "rdp.bridge",
            tab = %tab_actor,
            thread = %thread_actor,
            why = %attached.why,
            "attached to thread"
        );

        let console = match &tab_form.console_actor {
            Some(name) => Some(connection.get_or_create(name, |conn| {
                ConsoleActorProxy::new(name.clone(), conn)
            })?),
            None => None,
        };

        let pauses = Arc::new(ThreadPauseCoordinator::new());
        let thread_id = connection.ids().next();
        let thread_name = tab_form
            .title
            .clone()
            .unwrap_or_else(|| thread_actor.clone());
        pauses.notify_paused(thread_id, &thread_name, PauseType::User);
        let coordinator = ThreadCoordinator::new(
            thread_id,
            thread_name,
            RemoteThread::new(Arc::clone(&thread), console),
            Arc::clone(&pauses),
        );

        let breakpoints = Arc::new(BreakpointsManager::new(
            config.connection.event_channel_size,
        ));
        let loader = SourceLoader {
            conn: connection.handle(),
            protocol,
            thread: Arc::clone(&thread),
            coordinator: coordinator.clone(),
            breakpoints: Arc::clone(&breakpoints),
            loaded: Arc::default(),
        };
        for form in thread.sources().await? {
            loader.load(form)?;
        }

        let events = tokio::spawn(pump_events(
            Receivers {
                execution,
                new_sources,
                exited,
                navigated,
            },
            coordinator.clone(),
            loader,
            connection.shutdown_token(),
        ));

        coordinator.resume(None, None).await?;

        Ok(Self {
            connection,
            root,
            greeting,
            protocol,
            tab,
            tab_form,
            thread,
            coordinator,
            pauses,
            breakpoints,
            events,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn root(&self) -> &Arc<RootActorProxy> {
        &self.root
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn protocol(&self) -> BreakpointProtocol {
        self.protocol
    }

    pub fn tab(&self) -> &TabForm {
        &self.tab_form
    }

    pub fn thread(&self) -> &Arc<ThreadActorProxy> {
        &self.thread
    }

    pub fn coordinator(&self) -> &ThreadCoordinator<RemoteThread> {
        &self.coordinator
    }

    pub fn pause_coordinator(&self) -> &Arc<ThreadPauseCoordinator> {
        &self.pauses
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointsManager> {
        &self.breakpoints
    }

    /// Replace the breakpoints of the source at `url`.
    pub fn set_breakpoints(
        &self,
        url: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Vec<Arc<BreakpointInfo>> {
        self.breakpoints.set_breakpoints(url, breakpoints)
    }

    pub fn subscribe_breakpoint_changes(&self) -> broadcast::Receiver<BreakpointChanged> {
        self.breakpoints.subscribe_changes()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.connection.shutdown_token().cancelled().await;
    }

    /// Detach from the tab and close the connection.
    pub async fn detach(self) -> Result<()> {
        let result = self.tab.detach().await;
        self.connection.shutdown();
        self.coordinator.shutdown();
        let _ = self.events.await;
        result?;
        Ok(())
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(WireError::Io)?
        .next()
        .ok_or_else(|| {
            WireError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {host}:{port}"),
            ))
            .into()
        })
}

struct Receivers {
    execution: broadcast::Receiver<ExecutionEvent>,
    new_sources: broadcast::Receiver<SourceForm>,
    exited: broadcast::Receiver<ThreadExited>,
    navigated: broadcast::Receiver<TabNavigated>,
}

async fn pump_events(
    mut receivers: Receivers,
    coordinator: ThreadCoordinator<RemoteThread>,
    loader: SourceLoader,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receivers.execution.recv() => match event {
                Ok(ExecutionEvent::Paused(paused)) => {
                    tracing::debug!(target: "rdp.bridge", why = %paused.why, "thread paused by debuggee");
                    coordinator.on_paused();
                    if !loader.should_stop(&paused) {
                        tracing::debug!(target: "rdp.bridge", "hit condition not met; resuming");
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            if let Err(err) = coordinator.resume(None, None).await {
                                tracing::warn!(
                                    target: "rdp.bridge",
                                    error = %err,
                                    "failed to resume after an unmet hit condition"
                                );
                            }
                        });
                    }
                }
                Ok(ExecutionEvent::Resumed) => coordinator.on_resumed(),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "rdp.bridge", skipped, "execution events lagged");
                }
                Err(RecvError::Closed) => break,
            },
            source = receivers.new_sources.recv() => match source {
                Ok(form) => {
                    if let Err(err) = loader.load(form) {
                        tracing::warn!(target: "rdp.bridge", error = %err, "failed to load source");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "rdp.bridge", skipped, "newSource events lagged");
                }
                Err(RecvError::Closed) => break,
            },
            navigated = receivers.navigated.recv() => match navigated {
                Ok(TabNavigated { url, state }) => {
                    tracing::info!(target: "rdp.bridge", url = ?url, state = ?state, "tab navigated");
                    if state.as_deref() == Some("start") {
                        loader.clear();
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = receivers.exited.recv() => {
                tracing::info!(target: "rdp.bridge", "thread exited");
                break;
            }
        }
    }
    coordinator.shutdown();
    loader.clear();
}
