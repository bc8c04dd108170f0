use serde_json::{json, Value};

use crate::{actor::PendingRequests, connection::ConnectionHandle, types::Result};

/// An object named by an object grip. Pause-lifetime grips die on resume
/// unless promoted with [`ObjectActorProxy::thread_grip`].
pub struct ObjectActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests,
}

impl ObjectActorProxy {
    pub fn new(name: impl Into<String>, conn: ConnectionHandle) -> Self {
        Self {
            name: name.into(),
            conn,
            pending: PendingRequests::default(),
        }
    }

    /// `{prototype, ownProperties, safeGetterValues}` of the object.
    pub async fn prototype_and_properties(&self) -> Result<Value> {
        self.pending
            .request(
                &self.conn,
                (),
                json!({"to": self.name, "type": "prototypeAndProperties"}),
            )
            .await
    }

    /// Extend the grip's lifetime from the current pause to the thread's.
    pub async fn thread_grip(&self) -> Result<Value> {
        self.pending
            .request(&self.conn, (), json!({"to": self.name, "type": "threadGrip"}))
            .await
    }

    pub async fn release(&self) -> Result<()> {
        self.pending
            .request(&self.conn, (), json!({"to": self.name, "type": "release"}))
            .await?;
        Ok(())
    }
}

reply_only_actor!(ObjectActorProxy);
