use std::{any::Any, sync::Arc};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    actor::{error_reply, packet_type, reply_field, ActorProxy, PendingRequests},
    connection::ConnectionHandle,
    types::{
        ActorError, ExceptionBreakpoints, FrameForm, PausedEvent, Result, SourceForm,
        SourcePosition, StepKind,
    },
};

/// Reply families of the thread actor. The debuggee answers `attach`,
/// `interrupt`, `resume` and `detach` with typed packets that look exactly
/// like the matching notifications, so each gets its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadReply {
    Attach,
    Interrupt,
    Resume,
    Detach,
    Plain,
}

/// Execution state changes the debuggee reports on its own.
///
/// Paused and resumed share one channel: a consumer must see them in the
/// order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Paused(PausedEvent),
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExited;

pub struct ThreadActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests<ThreadReply>,
    execution: broadcast::Sender<ExecutionEvent>,
    new_source: broadcast::Sender<SourceForm>,
    exited: broadcast::Sender<ThreadExited>,
}

impl ThreadActorProxy {
    pub fn new(name: impl Into<String>, conn: ConnectionHandle) -> Self {
        let capacity = conn.event_channel_size();
        Self {
            name: name.into(),
            conn,
            pending: PendingRequests::default(),
            execution: broadcast::channel(capacity).0,
            new_source: broadcast::channel(capacity).0,
            exited: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_execution(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.execution.subscribe()
    }

    pub fn subscribe_new_source(&self) -> broadcast::Receiver<SourceForm> {
        self.new_source.subscribe()
    }

    pub fn subscribe_exited(&self) -> broadcast::Receiver<ThreadExited> {
        self.exited.subscribe()
    }

    async fn request(&self, kind: ThreadReply, mut request: Value) -> Result<Value> {
        request["to"] = Value::String(self.name.clone());
        self.pending.request(&self.conn, kind, request).await
    }

    /// Attach to the thread; the debuggee answers with a `paused` packet.
    pub async fn attach(&self, options: Value) -> Result<PausedEvent> {
        let reply = self
            .request(ThreadReply::Attach, json!({"type": "attach", "options": options}))
            .await?;
        Ok(PausedEvent::from_packet(reply))
    }

    pub async fn interrupt(&self) -> Result<PausedEvent> {
        let reply = self
            .request(ThreadReply::Interrupt, json!({"type": "interrupt"}))
            .await?;
        Ok(PausedEvent::from_packet(reply))
    }

    pub async fn resume(&self, exceptions: ExceptionBreakpoints, step: Option<StepKind>) -> Result<()> {
        let mut request = json!({
            "type": "resume",
            "pauseOnExceptions": exceptions.pause_on_exceptions(),
            "ignoreCaughtExceptions": exceptions.ignore_caught_exceptions(),
        });
        if let Some(step) = step {
            request["resumeLimit"] = json!({"type": step.resume_limit()});
        }
        self.request(ThreadReply::Resume, request).await?;
        Ok(())
    }

    pub async fn detach(&self) -> Result<()> {
        self.request(ThreadReply::Detach, json!({"type": "detach"}))
            .await?;
        Ok(())
    }

    pub async fn sources(&self) -> Result<Vec<SourceForm>> {
        let reply = self
            .request(ThreadReply::Plain, json!({"type": "sources"}))
            .await?;
        reply_field(&reply, "sources")
    }

    pub async fn frames(&self, start: u32, count: u32) -> Result<Vec<FrameForm>> {
        let reply = self
            .request(
                ThreadReply::Plain,
                json!({"type": "frames", "start": start, "count": count}),
            )
            .await?;
        reply_field(&reply, "frames")
    }

    /// Install a breakpoint owned by the thread rather than by a breakpoint
    /// actor. Works while the thread is running.
    pub async fn set_breakpoint(
        &self,
        source_url: &str,
        position: SourcePosition,
        condition: Option<&str>,
        log_value: Option<&str>,
    ) -> Result<()> {
        let mut options = json!({});
        if let Some(condition) = condition {
            options["condition"] = json!(condition);
        }
        if let Some(log_value) = log_value {
            options["logValue"] = json!(log_value);
        }
        self.request(
            ThreadReply::Plain,
            json!({
                "type": "setBreakpoint",
                "location": breakpoint_location(source_url, position),
                "options": options,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_breakpoint(&self, source_url: &str, position: SourcePosition) -> Result<()> {
        self.request(
            ThreadReply::Plain,
            json!({
                "type": "removeBreakpoint",
                "location": breakpoint_location(source_url, position),
            }),
        )
        .await?;
        Ok(())
    }

    fn on_paused(&self, packet: Value) {
        let why = packet
            .pointer("/why/type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let family = match why {
            "attached" => Some(ThreadReply::Attach),
            "interrupted" | "alreadyPaused" => Some(ThreadReply::Interrupt),
            _ => None,
        };
        if let Some(family) = family {
            if self.pending.has(family) {
                self.pending.resolve(family, packet);
                return;
            }
        }
        let _ = self
            .execution
            .send(ExecutionEvent::Paused(PausedEvent::from_packet(packet)));
    }
}

fn breakpoint_location(source_url: &str, position: SourcePosition) -> Value {
    json!({"sourceUrl": source_url, "line": position.line, "column": position.column})
}

impl ActorProxy for ThreadActorProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_response(&self, packet: Value) {
        if let Some(err) = error_reply(&self.name, &packet) {
            self.pending.reject_with(&self.name, err);
            return;
        }
        match packet_type(&packet) {
            Some("paused") => self.on_paused(packet),
            Some("resumed") => {
                if !self.pending.resolve(ThreadReply::Resume, packet) {
                    let _ = self.execution.send(ExecutionEvent::Resumed);
                }
            }
            Some("detached") => {
                if !self.pending.resolve(ThreadReply::Detach, packet) {
                    let _ = self.exited.send(ThreadExited);
                }
            }
            Some("exited") => {
                let _ = self.exited.send(ThreadExited);
            }
            Some("newSource") => match reply_field::<SourceForm>(&packet, "source") {
                Ok(source) => {
                    let _ = self.new_source.send(source);
                }
                Err(err) => {
                    tracing::warn!(target: "rdp.wire", actor = %self.name, error = %err, "malformed newSource");
                }
            },
            Some(kind) => {
                tracing::debug!(target: "rdp.wire", actor = %self.name, kind, "ignoring thread event");
            }
            None => {
                if !self.pending.resolve(ThreadReply::Plain, packet) {
                    tracing::warn!(target: "rdp.wire", actor = %self.name, "reply with no pending request dropped");
                }
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{mock::MockDebuggee, Connection, ConnectionConfig};

    async fn thread() -> (Connection, Arc<ThreadActorProxy>, MockDebuggee) {
        let (mock, stream) = MockDebuggee::pair();
        let (connection, _root) = Connection::from_stream(stream, ConnectionConfig::default());
        let thread = connection
            .get_or_create("thread1", |conn| ThreadActorProxy::new("thread1", conn))
            .unwrap();
        (connection, thread, mock)
    }

    #[tokio::test]
    async fn interrupted_pause_resolves_interrupt_while_breakpoint_pause_is_an_event() {
        let (_connection, thread, mut mock) = thread().await;
        let mut execution = thread.subscribe_execution();

        let interrupt = tokio::spawn({
            let thread = thread.clone();
            async move { thread.interrupt().await }
        });
        mock.expect_request("thread1", "interrupt").await;
        mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "breakpoint"}}))
            .await;
        mock.send(json!({"from": "thread1", "type": "paused", "why": {"type": "interrupted"}}))
            .await;

        assert_eq!(interrupt.await.unwrap().unwrap().why, "interrupted");
        match execution.recv().await.unwrap() {
            ExecutionEvent::Paused(event) => assert_eq!(event.why, "breakpoint"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_sends_exception_flags_and_step_limit() {
        let (_connection, thread, mut mock) = thread().await;

        let resume = tokio::spawn({
            let thread = thread.clone();
            async move {
                thread
                    .resume(ExceptionBreakpoints::Uncaught, Some(StepKind::Over))
                    .await
            }
        });
        let request = mock.expect_request("thread1", "resume").await;
        assert_eq!(request["pauseOnExceptions"], true);
        assert_eq!(request["ignoreCaughtExceptions"], true);
        assert_eq!(request["resumeLimit"]["type"], "next");
        mock.send(json!({"from": "thread1", "type": "resumed"})).await;

        resume.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsolicited_resumed_is_an_event() {
        let (_connection, thread, mut mock) = thread().await;
        let mut execution = thread.subscribe_execution();
        mock.send(json!({"from": "thread1", "type": "resumed"})).await;
        assert_eq!(execution.recv().await.unwrap(), ExecutionEvent::Resumed);
    }

    #[tokio::test]
    async fn error_reply_rejects_only_the_oldest_request() {
        let (_connection, thread, mut mock) = thread().await;

        let sources = tokio::spawn({
            let thread = thread.clone();
            async move { thread.sources().await }
        });
        mock.expect_request("thread1", "sources").await;
        let frames = tokio::spawn({
            let thread = thread.clone();
            async move { thread.frames(0, 20).await }
        });
        mock.expect_request("thread1", "frames").await;

        mock.send(json!({"from": "thread1", "error": "wrongState", "message": "not paused"}))
            .await;
        mock.send(json!({"from": "thread1", "frames": []})).await;

        let err = sources.await.unwrap().unwrap_err();
        assert!(matches!(err, ActorError::Remote { ref error, .. } if error == "wrongState"));
        assert!(frames.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_such_actor_rejects_every_pending_request() {
        let (_connection, thread, mut mock) = thread().await;

        let sources = tokio::spawn({
            let thread = thread.clone();
            async move { thread.sources().await }
        });
        mock.expect_request("thread1", "sources").await;
        let resume = tokio::spawn({
            let thread = thread.clone();
            async move { thread.resume(ExceptionBreakpoints::None, None).await }
        });
        mock.expect_request("thread1", "resume").await;

        mock.send(json!({"from": "thread1", "error": "noSuchActor"})).await;

        assert!(matches!(
            sources.await.unwrap(),
            Err(ActorError::NoSuchActor { .. })
        ));
        assert!(matches!(
            resume.await.unwrap(),
            Err(ActorError::NoSuchActor { .. })
        ));
    }

    #[tokio::test]
    async fn new_source_is_routed_to_its_channel() {
        let (_connection, thread, mut mock) = thread().await;
        let mut sources = thread.subscribe_new_source();
        mock.send(json!({
            "from": "thread1",
            "type": "newSource",
            "source": {"actor": "source1", "url": "https://example.test/app.js"},
        }))
        .await;

        let source = sources.recv().await.unwrap();
        assert_eq!(source.actor, "source1");
        assert_eq!(source.url.as_deref(), Some("https://example.test/app.js"));
    }
}
