use std::{any::Any, sync::Arc};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    actor::{error_reply, packet_type, ActorProxy, PendingRequests},
    connection::ConnectionHandle,
    types::{ActorError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabReply {
    Attach,
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabNavigated {
    pub url: Option<String>,
    /// `start` or `stop`.
    pub state: Option<String>,
}

pub struct TabActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests<TabReply>,
    navigated: broadcast::Sender<TabNavigated>,
    detached: broadcast::Sender<()>,
}

impl TabActorProxy {
    pub fn new(name: impl Into<String>, conn: ConnectionHandle) -> Self {
        let capacity = conn.event_channel_size();
        Self {
            name: name.into(),
            conn,
            pending: PendingRequests::default(),
            navigated: broadcast::channel(capacity).0,
            detached: broadcast::channel(capacity).0,
        }
    }

    /// Attach to the tab. Returns the name of the tab's thread actor.
    pub async fn attach(&self) -> Result<String> {
        let reply = self
            .pending
            .request(
                &self.conn,
                TabReply::Attach,
                json!({"to": self.name, "type": "attach"}),
            )
            .await?;
        reply
            .get("threadActor")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ActorError::UnexpectedReply("tabAttached without threadActor".into()))
    }

    pub async fn detach(&self) -> Result<()> {
        self.pending
            .request(
                &self.conn,
                TabReply::Detach,
                json!({"to": self.name, "type": "detach"}),
            )
            .await?;
        Ok(())
    }

    pub fn subscribe_navigated(&self) -> broadcast::Receiver<TabNavigated> {
        self.navigated.subscribe()
    }

    /// The debuggee dropped the tab on its own (closed, crashed).
    pub fn subscribe_detached(&self) -> broadcast::Receiver<()> {
        self.detached.subscribe()
    }
}

impl ActorProxy for TabActorProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_response(&self, packet: Value) {
        if let Some(err) = error_reply(&self.name, &packet) {
            self.pending.reject_with(&self.name, err);
            return;
        }
        match packet_type(&packet) {
            Some("tabAttached") => {
                if !self.pending.resolve(TabReply::Attach, packet) {
                    tracing::warn!(target: "rdp.wire", actor = %self.name, "unsolicited tabAttached");
                }
            }
            Some("detached") => {
                if !self.pending.resolve(TabReply::Detach, packet) {
                    let _ = self.detached.send(());
                }
            }
            Some("tabNavigated") => {
                let field = |key: &str| packet.get(key).and_then(Value::as_str).map(str::to_owned);
                let _ = self.navigated.send(TabNavigated {
                    url: field("url"),
                    state: field("state"),
                });
            }
            Some(kind) => {
                tracing::debug!(target: "rdp.wire", actor = %self.name, kind, "ignoring tab event");
            }
            None => {
                tracing::warn!(target: "rdp.wire", actor = %self.name, "untyped tab reply dropped");
            }
        }
    }

    fn connection_closed(&self) {
        self.pending.reject_all(ActorError::connection_closed());
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
