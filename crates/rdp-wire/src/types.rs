use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ActorError>;

/// Failures of the transport and the connection that owns it.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("failed to encode packet: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote debugging connection closed")]
    ConnectionClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out waiting for the remote debugger")]
    Timeout,
    #[error("outgoing packet has no `to` actor")]
    MissingTarget,
    #[error("actor `{name}` is already registered with a different proxy type")]
    ActorTypeMismatch { name: String },
}

/// Failures of a single request made through an actor proxy.
///
/// Cloneable so one failure (e.g. the connection closing) can be delivered to
/// every pending continuation.
#[derive(Debug, Clone, Error)]
pub enum ActorError {
    #[error("{error}: {}", .message.as_deref().unwrap_or("remote actor reported an error"))]
    Remote {
        error: String,
        message: Option<String>,
    },
    #[error("actor `{actor}` no longer exists")]
    NoSuchActor { actor: String },
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("{0} is not available")]
    Unavailable(&'static str),
    #[error(transparent)]
    Wire(Arc<WireError>),
}

impl ActorError {
    pub fn connection_closed() -> Self {
        ActorError::Wire(Arc::new(WireError::ConnectionClosed))
    }
}

impl From<WireError> for ActorError {
    fn from(err: WireError) -> Self {
        ActorError::Wire(Arc::new(err))
    }
}

/// The unsolicited packet the root actor sends as soon as the stream opens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeting {
    pub application_type: String,
    #[serde(default)]
    pub traits: Value,
}

impl Greeting {
    pub fn has_trait(&self, name: &str) -> bool {
        self.traits
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabForm {
    pub actor: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub console_actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceForm {
    pub actor: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source_map_url: Option<String>,
    #[serde(default)]
    pub is_black_boxed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameForm {
    pub actor: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "where", default)]
    pub location: Option<FrameLocation>,
    #[serde(default)]
    pub this: Option<Grip>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameLocation {
    #[serde(default)]
    pub actor: Option<String>,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// A `(line, column)` pair in a source. Lines are 1-based, columns 0-based,
/// matching what the debuggee reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// A `paused` notification from a thread actor.
#[derive(Debug, Clone, PartialEq)]
pub struct PausedEvent {
    /// The `why.type` of the pause (`breakpoint`, `resumeLimit`, `exception`, ...).
    pub why: String,
    pub frame: Option<FrameForm>,
    pub packet: Value,
}

impl PausedEvent {
    pub(crate) fn from_packet(packet: Value) -> Self {
        let why = packet
            .pointer("/why/type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let frame = packet
            .get("frame")
            .and_then(|frame| serde_json::from_value(frame.clone()).ok());
        Self { why, frame, packet }
    }
}

/// Remote value descriptor: a JSON primitive, a special value such as
/// `{type: "undefined"}`, or an object grip naming an object actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grip(pub Value);

impl Grip {
    /// The object actor behind an object grip.
    pub fn object_actor(&self) -> Option<&str> {
        if self.type_name() != Some("object") {
            return None;
        }
        self.0.get("actor").and_then(Value::as_str)
    }

    pub fn class(&self) -> Option<&str> {
        self.0.get("class").and_then(Value::as_str)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn is_primitive(&self) -> bool {
        !self.0.is_object()
    }
}

/// Result of `evaluateJS` on a console actor.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: Grip,
    pub exception: Option<Grip>,
    pub exception_message: Option<String>,
}

impl Evaluation {
    pub(crate) fn from_packet(packet: &Value) -> Self {
        let grip = |key: &str| packet.get(key).cloned().map(Grip);
        Self {
            result: grip("result").unwrap_or(Grip(Value::Null)),
            exception: grip("exception").filter(|grip| !grip.0.is_null()),
            exception_message: packet
                .get("exceptionMessage")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    In,
    Over,
    Out,
}

impl StepKind {
    /// The `resumeLimit.type` sent with a stepping resume.
    pub fn resume_limit(self) -> &'static str {
        match self {
            StepKind::In => "step",
            StepKind::Over => "next",
            StepKind::Out => "finish",
        }
    }
}

/// Which exceptions pause the thread; sent along with every resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionBreakpoints {
    All,
    Uncaught,
    #[default]
    None,
}

impl ExceptionBreakpoints {
    pub fn pause_on_exceptions(self) -> bool {
        !matches!(self, ExceptionBreakpoints::None)
    }

    pub fn ignore_caught_exceptions(self) -> bool {
        matches!(self, ExceptionBreakpoints::Uncaught)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn object_grip_exposes_actor() {
        let grip = Grip(json!({"type": "object", "actor": "obj1", "class": "Array"}));
        assert_eq!(grip.object_actor(), Some("obj1"));
        assert_eq!(grip.class(), Some("Array"));
        assert!(!grip.is_primitive());

        let undefined = Grip(json!({"type": "undefined"}));
        assert_eq!(undefined.object_actor(), None);
        assert!(Grip(json!(42)).is_primitive());
    }

    #[test]
    fn paused_event_reads_reason_and_frame() {
        let event = PausedEvent::from_packet(json!({
            "from": "thread1",
            "type": "paused",
            "why": {"type": "breakpoint", "actors": ["bp1"]},
            "frame": {"actor": "frame1", "type": "call", "where": {"actor": "src1", "line": 4, "column": 2}},
        }));
        assert_eq!(event.why, "breakpoint");
        let frame = event.frame.expect("frame");
        assert_eq!(frame.actor, "frame1");
        assert_eq!(frame.location.map(|l| (l.line, l.column)), Some((4, 2)));
    }

    #[test]
    fn exception_filters_map_to_resume_flags() {
        assert!(!ExceptionBreakpoints::None.pause_on_exceptions());
        assert!(ExceptionBreakpoints::All.pause_on_exceptions());
        assert!(!ExceptionBreakpoints::All.ignore_caught_exceptions());
        assert!(ExceptionBreakpoints::Uncaught.ignore_caught_exceptions());
    }

    #[test]
    fn remote_error_display_includes_message() {
        let err = ActorError::Remote {
            error: "wrongState".into(),
            message: Some("thread is running".into()),
        };
        assert_eq!(err.to_string(), "wrongState: thread is running");
    }
}
