use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    actor::{reply_field, PendingRequests},
    connection::ConnectionHandle,
    types::{ActorError, Grip, Result, SourceForm, SourcePosition},
};

/// Settable breakpoint positions of a source: line → sorted columns.
pub type BreakpointPositions = BTreeMap<u32, Vec<u32>>;

/// Reply to the legacy `setBreakpoint` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointReply {
    /// The breakpoint actor that now owns the breakpoint.
    pub actor: String,
    #[serde(default)]
    pub actual_location: Option<SourcePosition>,
    #[serde(default)]
    pub is_pending: bool,
}

pub struct SourceActorProxy {
    name: String,
    conn: ConnectionHandle,
    pending: PendingRequests,
    form: SourceForm,
}

impl SourceActorProxy {
    pub fn new(form: SourceForm, conn: ConnectionHandle) -> Self {
        Self {
            name: form.actor.clone(),
            conn,
            pending: PendingRequests::default(),
            form,
        }
    }

    pub fn form(&self) -> &SourceForm {
        &self.form
    }

    pub fn url(&self) -> Option<&str> {
        self.form.url.as_deref()
    }

    async fn request(&self, mut request: Value) -> Result<Value> {
        request["to"] = Value::String(self.name.clone());
        self.pending.request(&self.conn, (), request).await
    }

    pub async fn breakpoint_positions(&self) -> Result<BreakpointPositions> {
        let reply = self
            .request(json!({"type": "getBreakpointPositionsCompressed"}))
            .await?;
        let raw: BTreeMap<String, Vec<u32>> = reply_field(&reply, "positions")?;
        raw.into_iter()
            .map(|(line, mut columns)| -> Result<(u32, Vec<u32>)> {
                let line = line.parse::<u32>().map_err(|_| {
                    ActorError::UnexpectedReply(format!("breakpoint position line {line:?}"))
                })?;
                columns.sort_unstable();
                columns.dedup();
                Ok((line, columns))
            })
            .collect()
    }

    /// Install a breakpoint through a breakpoint actor (legacy protocol). The
    /// thread must be paused.
    pub async fn set_breakpoint(
        &self,
        position: SourcePosition,
        condition: Option<&str>,
        log_value: Option<&str>,
    ) -> Result<SetBreakpointReply> {
        let mut request = json!({
            "type": "setBreakpoint",
            "location": {"line": position.line, "column": position.column},
        });
        if let Some(condition) = condition {
            request["condition"] = json!(condition);
        }
        if let Some(log_value) = log_value {
            request["logValue"] = json!(log_value);
        }
        let reply = self.request(request).await?;
        serde_json::from_value(reply)
            .map_err(|err| ActorError::UnexpectedReply(format!("setBreakpoint reply: {err}")))
    }

    /// The source text (or a long string grip for large sources).
    pub async fn source(&self) -> Result<Grip> {
        let reply = self.request(json!({"type": "source"})).await?;
        reply_field(&reply, "source")
    }
}

reply_only_actor!(SourceActorProxy);
