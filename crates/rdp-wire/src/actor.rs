//! The contract between the [`Connection`](crate::Connection) and the typed
//! proxies standing in for remote actors.

use std::{any::Any, collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    connection::ConnectionHandle,
    types::{ActorError, Result},
};

/// Local stand-in for one remote actor.
///
/// The connection routes every inbound packet whose `from` names this actor to
/// [`ActorProxy::receive_response`]. Implementations decide whether a packet
/// answers a pending request or is an unsolicited event.
pub trait ActorProxy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn receive_response(&self, packet: Value);

    /// The connection is gone; fail everything still waiting on a reply.
    fn connection_closed(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Continuations waiting for replies from one actor, in send order.
///
/// `K` tags the reply family a request expects. Actors that answer every
/// request with an untyped reply use the default `()`; the thread actor uses
/// one family per typed reply so a `paused` reply can resolve an interrupt
/// while other `paused` packets are treated as events.
pub struct PendingRequests<K = ()> {
    queue: Mutex<VecDeque<(K, oneshot::Sender<Result<Value>>)>>,
}

impl<K> Default for PendingRequests<K> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<K: Copy + PartialEq> PendingRequests<K> {
    /// Send `request` and enqueue its continuation.
    ///
    /// The packet is handed to the writer while the queue lock is held, so the
    /// queue order always matches the order requests hit the wire.
    pub fn send(
        &self,
        conn: &ConnectionHandle,
        kind: K,
        request: Value,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue.lock();
        conn.send_request(&request)?;
        queue.push_back((kind, tx));
        Ok(rx)
    }

    pub async fn request(&self, conn: &ConnectionHandle, kind: K, request: Value) -> Result<Value> {
        let rx = self.send(conn, kind, request)?;
        rx.await.map_err(|_| ActorError::connection_closed())?
    }

    pub fn has(&self, kind: K) -> bool {
        self.queue.lock().iter().any(|(pending, _)| *pending == kind)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Resolve the oldest request of family `kind`. Returns `false` when none
    /// is waiting.
    pub fn resolve(&self, kind: K, packet: Value) -> bool {
        let tx = {
            let mut queue = self.queue.lock();
            let Some(idx) = queue.iter().position(|(pending, _)| *pending == kind) else {
                return false;
            };
            queue.remove(idx).map(|(_, tx)| tx)
        };
        if let Some(tx) = tx {
            let _ = tx.send(Ok(packet));
        }
        true
    }

    /// Reject the oldest request regardless of family.
    pub fn reject_oldest(&self, err: ActorError) -> bool {
        let Some((_, tx)) = self.queue.lock().pop_front() else {
            return false;
        };
        let _ = tx.send(Err(err));
        true
    }

    pub fn reject_all(&self, err: ActorError) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Route an `error` reply: `noSuchActor` fails everything queued on the
    /// actor, any other error only the oldest request.
    pub fn reject_with(&self, actor: &str, err: ActorError) {
        if matches!(err, ActorError::NoSuchActor { .. }) {
            self.reject_all(err);
            return;
        }
        if !self.reject_oldest(err) {
            tracing::warn!(target: "rdp.wire", actor, "error reply with no pending request");
        }
    }
}

impl PendingRequests<()> {
    /// Settle the oldest request with an untyped reply packet.
    pub fn settle(&self, actor: &str, packet: Value) {
        if let Some(err) = error_reply(actor, &packet) {
            self.reject_with(actor, err);
            return;
        }
        if !self.resolve((), packet) {
            tracing::warn!(target: "rdp.wire", actor, "reply with no pending request dropped");
        }
    }
}

/// The error carried by a reply packet, if any.
pub fn error_reply(actor: &str, packet: &Value) -> Option<ActorError> {
    let error = packet.get("error")?.as_str()?;
    if error == "noSuchActor" {
        return Some(ActorError::NoSuchActor {
            actor: actor.to_string(),
        });
    }
    Some(ActorError::Remote {
        error: error.to_string(),
        message: packet
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

pub fn packet_type(packet: &Value) -> Option<&str> {
    packet.get("type").and_then(Value::as_str)
}

/// Deserialize one field of a reply.
pub(crate) fn reply_field<T: serde::de::DeserializeOwned>(packet: &Value, field: &str) -> Result<T> {
    let value = packet
        .get(field)
        .cloned()
        .ok_or_else(|| ActorError::UnexpectedReply(format!("reply has no `{field}` field")))?;
    serde_json::from_value(value)
        .map_err(|err| ActorError::UnexpectedReply(format!("malformed `{field}`: {err}")))
}
