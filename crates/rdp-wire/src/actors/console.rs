use serde_json::json;

use crate::{
    actor::PendingRequests,
    connection::ConnectionHandle,
    types::{Evaluation, Result},
};

pub struct ConsoleActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests,
}

impl ConsoleActorProxy {
    pub fn new(name: impl Into<String>, conn: ConnectionHandle) -> Self {
        Self {
            name: name.into(),
            conn,
            pending: PendingRequests::default(),
        }
    }

    /// Evaluate `text`, in the scope of `frame_actor` when given.
    pub async fn evaluate(&self, text: &str, frame_actor: Option<&str>) -> Result<Evaluation> {
        let mut request = json!({"to": self.name, "type": "evaluateJS", "text": text});
        if let Some(frame_actor) = frame_actor {
            request["frameActor"] = json!(frame_actor);
        }
        let reply = self.pending.request(&self.conn, (), request).await?;
        Ok(Evaluation::from_packet(&reply))
    }
}

reply_only_actor!(ConsoleActorProxy);
