//! A scripted remote debuggee for unit and integration tests.
//!
//! Tests drive it packet by packet: wait for the next request from the client,
//! assert on it, then write whatever replies and events the scenario needs.
//! Nothing is answered automatically.

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::TcpListener,
};

use crate::codec::{encode_frame, FrameDecoder};

const DUPLEX_CAPACITY: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockDebuggee {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    decoder: FrameDecoder,
    inbox: VecDeque<Value>,
}

impl MockDebuggee {
    /// An in-memory debuggee and the client end of its stream.
    pub fn pair() -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (reader, writer) = tokio::io::split(server);
        (Self::from_io(reader, writer), client)
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            decoder: FrameDecoder::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Listen on an ephemeral loopback port; the returned listener hands out a
    /// debuggee per accepted client.
    pub async fn bind() -> std::io::Result<MockListener> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        Ok(MockListener { listener })
    }

    /// Send the root greeting with the given traits.
    pub async fn greet(&mut self, traits: Value) {
        self.send(json!({"from": "root", "applicationType": "browser", "traits": traits}))
            .await;
    }

    pub async fn send(&mut self, packet: Value) {
        let frame = encode_frame(&packet).expect("mock packet must serialize");
        self.send_raw(&frame).await;
    }

    /// Write bytes verbatim, e.g. to inject framing errors.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer
            .write_all(bytes)
            .await
            .expect("mock debuggee write failed");
        self.writer.flush().await.expect("mock debuggee flush failed");
    }

    /// The next packet from the client, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(packet) = self.inbox.pop_front() {
                return Some(packet);
            }
            let n = self.reader.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            let packets = self
                .decoder
                .decode(&buf[..n])
                .expect("client sent a malformed frame");
            self.inbox.extend(packets);
        }
    }

    /// Wait for the next request and assert its target and type.
    pub async fn expect_request(&mut self, to: &str, kind: &str) -> Value {
        let packet = tokio::time::timeout(RECV_TIMEOUT, self.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind} request to {to}"))
            .unwrap_or_else(|| panic!("client hung up while waiting for {kind} request to {to}"));
        assert_eq!(packet["to"], to, "unexpected request target: {packet}");
        assert_eq!(packet["type"], kind, "unexpected request type: {packet}");
        packet
    }

    /// Assert that the client sends nothing for `within`.
    pub async fn expect_silence(&mut self, within: Duration) {
        if let Ok(Some(packet)) = tokio::time::timeout(within, self.recv()).await {
            panic!("expected no request, got {packet}");
        }
    }
}

pub struct MockListener {
    listener: TcpListener,
}

impl MockListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> std::io::Result<MockDebuggee> {
        let (stream, _) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(MockDebuggee::from_io(reader, writer))
    }
}
