//! Length-prefixed JSON framing.
//!
//! Every packet on the wire is encoded as
//!
//! ```text
//! <decimal byte length>:<UTF-8 JSON payload>
//! ```
//!
//! There is no terminator and no frame size limit. [`FrameDecoder`] is a
//! synchronous two-state parser so the read loop can feed it whatever chunks
//! the socket hands out.

use serde_json::Value;

use crate::types::WireError;

const DELIMITER: u8 = b':';

fn sanitize_json_error_message(message: &str) -> String {
    // `serde_json::Error` display strings can echo scalar values from the payload, and packets
    // carry evaluated expressions and their results. Keep the position, drop the values.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Encode one packet as a frame.
pub fn encode_frame(message: &Value) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = payload.len().to_string().into_bytes();
    frame.reserve(payload.len() + 1);
    frame.push(DELIMITER);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ReadingHeader,
    ReadingBody { len: usize },
}

/// Incremental frame parser.
///
/// Bytes past a complete header are the start of the body; bytes past a
/// complete body are carried into the next frame.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buf: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingHeader,
            buf: Vec::new(),
        }
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Consume `chunk`, appending every packet it completes to `out` in wire
    /// order.
    ///
    /// On error, packets decoded before the malformed frame are still in
    /// `out`. A framing error is not recoverable: the stream has lost
    /// synchronisation and the decoder must not be fed again.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Value>) -> Result<(), WireError> {
        self.buf.extend_from_slice(chunk);
        let mut consumed = 0;
        let result = loop {
            match self.state {
                DecodeState::ReadingHeader => {
                    let pending = &self.buf[consumed..];
                    let Some(delimiter) = pending.iter().position(|&b| b == DELIMITER) else {
                        // Reject garbage before the delimiter shows up so a peer speaking the
                        // wrong protocol fails fast instead of buffering forever.
                        if pending.iter().any(|b| !b.is_ascii_digit()) {
                            break Err(malformed_header(pending));
                        }
                        break Ok(());
                    };
                    match parse_length(&pending[..delimiter]) {
                        Ok(len) => {
                            consumed += delimiter + 1;
                            self.state = DecodeState::ReadingBody { len };
                        }
                        Err(err) => break Err(err),
                    }
                }
                DecodeState::ReadingBody { len } => {
                    if self.buf.len() - consumed < len {
                        break Ok(());
                    }
                    let body = &self.buf[consumed..consumed + len];
                    match decode_payload(body) {
                        Ok(message) => out.push(message),
                        Err(err) => break Err(err),
                    }
                    consumed += len;
                    self.state = DecodeState::ReadingHeader;
                }
            }
        };
        self.buf.drain(..consumed);
        result
    }

    /// Convenience wrapper around [`FrameDecoder::feed`] for callers that
    /// treat any error as fatal.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Value>, WireError> {
        let mut out = Vec::new();
        self.feed(chunk, &mut out)?;
        Ok(out)
    }
}

fn malformed_header(header: &[u8]) -> WireError {
    let shown: String = String::from_utf8_lossy(header).chars().take(16).collect();
    WireError::Framing(format!("malformed length prefix {shown:?}"))
}

fn parse_length(header: &[u8]) -> Result<usize, WireError> {
    if header.is_empty() {
        return Err(WireError::Framing("empty length prefix".into()));
    }
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(malformed_header(header));
    }
    // Digits only, so the only possible failure is overflow.
    std::str::from_utf8(header)
        .ok()
        .and_then(|digits| digits.parse::<usize>().ok())
        .ok_or_else(|| WireError::Framing("length prefix overflows usize".into()))
}

fn decode_payload(body: &[u8]) -> Result<Value, WireError> {
    let text = std::str::from_utf8(body)
        .map_err(|err| WireError::Framing(format!("payload is not valid UTF-8: {err}")))?;
    serde_json::from_str(text).map_err(|err| {
        WireError::Framing(format!(
            "payload is not valid JSON: {}",
            sanitize_json_error_message(&err.to_string())
        ))
    })
}
