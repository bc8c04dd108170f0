use std::{any::Any, sync::Arc};

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use crate::{
    actor::{error_reply, packet_type, reply_field, ActorProxy, PendingRequests},
    connection::ConnectionHandle,
    types::{ActorError, Greeting, Result, TabForm, WireError},
};

pub const ROOT_ACTOR: &str = "root";

/// The root actor: always present, greets the client when the stream opens.
pub struct RootActorProxy {
    conn: ConnectionHandle,
    pending: PendingRequests,
    greeting: watch::Sender<Option<Greeting>>,
    closed: watch::Sender<bool>,
    tab_list_changed: broadcast::Sender<()>,
}

impl RootActorProxy {
    pub fn new(conn: ConnectionHandle, event_channel_size: usize) -> Self {
        Self {
            conn,
            pending: PendingRequests::default(),
            greeting: watch::Sender::new(None),
            closed: watch::Sender::new(false),
            tab_list_changed: broadcast::channel(event_channel_size).0,
        }
    }

    /// Wait for the greeting packet. Returns immediately once it has arrived.
    pub async fn greeting(&self) -> std::result::Result<Greeting, WireError> {
        let mut greeting_rx = self.greeting.subscribe();
        let mut closed_rx = self.closed.subscribe();
        loop {
            let greeting = greeting_rx.borrow_and_update().clone();
            if let Some(greeting) = greeting {
                return Ok(greeting);
            }
            if *closed_rx.borrow_and_update() {
                return Err(WireError::ConnectionClosed);
            }
            tokio::select! {
                changed = greeting_rx.changed() => changed.map_err(|_| WireError::ConnectionClosed)?,
                changed = closed_rx.changed() => changed.map_err(|_| WireError::ConnectionClosed)?,
            }
        }
    }

    pub fn subscribe_tab_list_changed(&self) -> broadcast::Receiver<()> {
        self.tab_list_changed.subscribe()
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabForm>> {
        let reply = self
            .pending
            .request(&self.conn, (), json!({"to": ROOT_ACTOR, "type": "listTabs"}))
            .await?;
        reply_field(&reply, "tabs")
    }

    /// Global actors (preference, device, ...) as advertised by the debuggee.
    pub async fn get_root(&self) -> Result<Value> {
        self.pending
            .request(&self.conn, (), json!({"to": ROOT_ACTOR, "type": "getRoot"}))
            .await
    }
}

impl ActorProxy for RootActorProxy {
    fn name(&self) -> &str {
        ROOT_ACTOR
    }

    fn receive_response(&self, packet: Value) {
        if packet.get("applicationType").is_some() {
            match serde_json::from_value::<Greeting>(packet) {
                Ok(greeting) => {
                    self.greeting.send_replace(Some(greeting));
                }
                Err(err) => {
                    tracing::warn!(target: "rdp.wire", error = %err, "malformed root greeting");
                }
            }
            return;
        }

        match packet_type(&packet) {
            Some("tabListChanged") => {
                let _ = self.tab_list_changed.send(());
            }
            Some(kind) => {
                tracing::debug!(target: "rdp.wire", actor = ROOT_ACTOR, kind, "ignoring root event");
            }
            None => {
                if let Some(err) = error_reply(ROOT_ACTOR, &packet) {
                    self.pending.reject_with(ROOT_ACTOR, err);
                } else if !self.pending.resolve((), packet) {
                    tracing::warn!(target: "rdp.wire", actor = ROOT_ACTOR, "reply with no pending request dropped");
                }
            }
        }
    }

    fn connection_closed(&self) {
        self.closed.send_replace(true);
        self.pending.reject_all(ActorError::connection_closed());
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{mock::MockDebuggee, Connection, ConnectionConfig};

    #[tokio::test]
    async fn replies_resolve_in_send_order() {
        let (mut mock, stream) = MockDebuggee::pair();
        let (_connection, root) = Connection::from_stream(stream, ConnectionConfig::default());
        mock.greet(json!({})).await;

        let first = tokio::spawn({
            let root = root.clone();
            async move { root.list_tabs().await }
        });
        mock.expect_request("root", "listTabs").await;
        let second = tokio::spawn({
            let root = root.clone();
            async move { root.get_root().await }
        });
        mock.expect_request("root", "getRoot").await;

        mock.send(json!({"from": "root", "tabs": [{"actor": "tab1"}]})).await;
        mock.send(json!({"from": "root", "preferenceActor": "pref1"})).await;

        assert_eq!(first.await.unwrap().unwrap()[0].actor, "tab1");
        assert_eq!(second.await.unwrap().unwrap()["preferenceActor"], "pref1");
    }

    #[tokio::test]
    async fn list_changes_are_events_even_with_requests_pending() {
        let (mut mock, stream) = MockDebuggee::pair();
        let (_connection, root) = Connection::from_stream(stream, ConnectionConfig::default());
        mock.greet(json!({})).await;
        let mut changes = root.subscribe_tab_list_changed();

        let tabs = tokio::spawn({
            let root = root.clone();
            async move { root.list_tabs().await }
        });
        mock.expect_request("root", "listTabs").await;
        mock.send(json!({"from": "root", "type": "tabListChanged"})).await;
        mock.send(json!({"from": "root", "tabs": []})).await;

        changes.recv().await.unwrap();
        assert!(tabs.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn greeting_fails_when_connection_closes_first() {
        let (mock, stream) = MockDebuggee::pair();
        let (_connection, root) = Connection::from_stream(stream, ConnectionConfig::default());
        drop(mock);
        assert!(matches!(root.greeting().await, Err(WireError::ConnectionClosed)));
    }
}
