use serde_json::json;

use crate::{actor::PendingRequests, connection::ConnectionHandle, types::Result};

/// A breakpoint installed through the legacy protocol.
pub struct BreakpointActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests,
}

impl BreakpointActorProxy {
    pub fn new(name: impl Into<String>, conn: ConnectionHandle) -> Self {
        Self {
            name: name.into(),
            conn,
            pending: PendingRequests::default(),
        }
    }

    pub async fn delete(&self) -> Result<()> {
        self.pending
            .request(&self.conn, (), json!({"to": self.name, "type": "delete"}))
            .await?;
        Ok(())
    }
}

reply_only_actor!(BreakpointActorProxy);
