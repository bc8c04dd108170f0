use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    actor::{packet_type, ActorProxy},
    actors::root::RootActorProxy,
    codec::{encode_frame, FrameDecoder},
    types::{Greeting, WireError},
};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for the root actor's greeting after connecting.
    pub greeting_timeout: Duration,
    /// Capacity of each proxy's event channels.
    pub event_channel_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            greeting_timeout: Duration::from_secs(5),
            event_channel_size: 64,
            read_buffer_size: 16 * 1024,
        }
    }
}

/// Monotonic id source scoped to one connection.
#[derive(Debug)]
pub struct IdGenerator(AtomicU64);

impl Default for IdGenerator {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl IdGenerator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    actors: Mutex<HashMap<String, Arc<dyn ActorProxy>>>,
    ids: IdGenerator,
    shutdown: CancellationToken,
    config: ConnectionConfig,
}

/// One debuggee connection: the transport, the actor registry and the tasks
/// pumping packets in both directions.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning back-reference held by actor proxies.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Weak<Inner>,
}

impl Connection {
    /// Dial the debuggee and wait for the root greeting.
    pub async fn connect(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, Arc<RootActorProxy>, Greeting), WireError> {
        let stream = tokio::time::timeout(config.greeting_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let greeting_timeout = config.greeting_timeout;
        let span = tracing::info_span!(target: "rdp.wire", "connection", peer = %addr);
        let (connection, root) = Self::spawn(reader, writer, config, span);

        let greeting = match tokio::time::timeout(greeting_timeout, root.greeting()).await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(err)) => {
                connection.shutdown();
                return Err(err);
            }
            Err(_) => {
                connection.shutdown();
                return Err(WireError::Timeout);
            }
        };
        tracing::info!(
            target: "rdp.wire",
            application_type = %greeting.application_type,
            "connected to remote debugger"
        );
        Ok((connection, root, greeting))
    }

    /// Run the protocol over an arbitrary reader/writer pair.
    ///
    /// The root proxy is registered before the read loop starts, so the
    /// greeting is never dropped.
    pub fn from_io<R, W>(reader: R, writer: W, config: ConnectionConfig) -> (Self, Arc<RootActorProxy>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let span = tracing::info_span!(target: "rdp.wire", "connection");
        Self::spawn(reader, writer, config, span)
    }

    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> (Self, Arc<RootActorProxy>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_io(reader, writer, config)
    }

    fn spawn<R, W>(
        reader: R,
        writer: W,
        config: ConnectionConfig,
        span: tracing::Span,
    ) -> (Self, Arc<RootActorProxy>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outgoing,
            actors: Mutex::new(HashMap::new()),
            ids: IdGenerator::default(),
            shutdown: CancellationToken::new(),
            config,
        });

        let connection = Self { inner };
        let root = Arc::new(RootActorProxy::new(
            connection.handle(),
            connection.inner.config.event_channel_size,
        ));
        connection.register(root.clone());

        tokio::spawn(
            write_loop(writer, rx, connection.inner.shutdown.clone()).instrument(span.clone()),
        );
        tokio::spawn(read_loop(reader, connection.inner.clone()).instrument(span));

        (connection, root)
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Per-connection monotonic ids (thread ids, breakpoint ids, ...).
    pub fn ids(&self) -> &IdGenerator {
        &self.inner.ids
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// A token that is cancelled when the connection shuts down, either
    /// explicitly via [`Connection::shutdown`] or because the stream closed or
    /// lost framing.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Register `actor` under its name, replacing any previous proxy.
    pub fn register(&self, actor: Arc<dyn ActorProxy>) {
        let name = actor.name().to_string();
        let previous = self.inner.actors.lock().insert(name.clone(), actor);
        if previous.is_some() {
            tracing::warn!(target: "rdp.wire", actor = %name, "replaced an already registered actor proxy");
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ActorProxy>> {
        self.inner.actors.lock().remove(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.actors.lock().contains_key(name)
    }

    /// Return the proxy registered under `name`, creating and registering it
    /// with `factory` if there is none.
    ///
    /// This is the only place proxies are deduplicated; callers that build
    /// proxies by hand and [`register`](Self::register) them bypass it.
    pub fn get_or_create<T, F>(&self, name: &str, factory: F) -> Result<Arc<T>, WireError>
    where
        T: ActorProxy,
        F: FnOnce(ConnectionHandle) -> T,
    {
        let mut actors = self.inner.actors.lock();
        if let Some(existing) = actors.get(name) {
            return existing
                .clone()
                .into_any()
                .downcast::<T>()
                .map_err(|_| WireError::ActorTypeMismatch {
                    name: name.to_string(),
                });
        }

        let actor = Arc::new(factory(self.handle()));
        let erased: Arc<dyn ActorProxy> = actor.clone();
        actors.insert(name.to_string(), erased);
        Ok(actor)
    }

    /// Queue `message` for the writer. The packet must name its target actor.
    pub fn send_request(&self, message: &Value) -> Result<(), WireError> {
        self.inner.send(message)
    }
}

impl ConnectionHandle {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }

    pub fn send_request(&self, message: &Value) -> Result<(), WireError> {
        let inner = self.inner.upgrade().ok_or(WireError::ConnectionClosed)?;
        inner.send(message)
    }

    pub fn event_channel_size(&self) -> usize {
        self.inner
            .upgrade()
            .map(|inner| inner.config.event_channel_size)
            .unwrap_or(1)
    }
}

impl Inner {
    fn send(&self, message: &Value) -> Result<(), WireError> {
        let Some(to) = message.get("to").and_then(Value::as_str) else {
            return Err(WireError::MissingTarget);
        };
        if self.shutdown.is_cancelled() {
            return Err(WireError::ConnectionClosed);
        }
        let frame = encode_frame(message)?;
        let kind = packet_type(message).unwrap_or("");
        tracing::trace!(target: "rdp.wire", to, kind, "send");
        self.outgoing
            .send(frame)
            .map_err(|_| WireError::ConnectionClosed)
    }

    fn dispatch(&self, packet: Value) {
        let Some(from) = packet.get("from").and_then(Value::as_str) else {
            tracing::warn!(target: "rdp.wire", "dropping packet without a `from` actor");
            return;
        };
        let from = from.to_string();
        let actor = self.actors.lock().get(&from).cloned();
        match actor {
            Some(actor) => actor.receive_response(packet),
            None => {
                tracing::warn!(target: "rdp.wire", from = %from, "dropping packet from unknown actor");
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!(target: "rdp.wire", error = %err, "write to remote debugger failed");
            shutdown.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, inner: Arc<Inner>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];
    let mut packets = Vec::new();

    loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read(&mut buf) => res,
        };
        let n = match read {
            Ok(0) => {
                tracing::debug!(target: "rdp.wire", "remote debugger closed the stream");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(target: "rdp.wire", error = %err, "read from remote debugger failed");
                break;
            }
        };

        let fed = decoder.feed(&buf[..n], &mut packets);
        for packet in packets.drain(..) {
            inner.dispatch(packet);
        }
        if let Err(err) = fed {
            tracing::error!(target: "rdp.wire", error = %err, "closing connection after framing error");
            break;
        }
    }

    inner.shutdown.cancel();

    let actors: Vec<_> = inner.actors.lock().values().cloned().collect();
    for actor in actors {
        actor.connection_closed();
    }
}
