use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::frame::{Frame, Notification, Request, Response, RpcErrorObject, JSONRPC_VERSION};
use super::ProtocolError;

/// Default upper bound for a single frame, excluding the newline.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Wire shape shared by every frame kind.
///
/// Field order matters for readability of the output only: `id` is written
/// after `params` so requests read as `{"jsonrpc","method","params","id"}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    // `"result": null` is a valid result, so presence is tracked separately from value.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorObject>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a frame as a single line of JSON, without the trailing newline.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let wire = match frame {
        Frame::Request(Request { id, method, params }) => WireFrame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.clone()),
            params: params.clone(),
            id: Some(*id),
            result: None,
            error: None,
        },
        Frame::Notification(Notification { method, params }) => WireFrame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.clone()),
            params: params.clone(),
            id: None,
            result: None,
            error: None,
        },
        Frame::Response(Response { id, outcome }) => {
            let (result, error) = match outcome {
                Ok(value) => (Some(value.clone()), None),
                Err(err) => (None, Some(err.clone())),
            };
            WireFrame {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method: None,
                params: None,
                id: Some(*id),
                result,
                error,
            }
        }
    };

    serde_json::to_string(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode one line into a frame.
pub fn decode(line: &[u8]) -> Result<Frame, ProtocolError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::malformed(e.to_string(), None))?;

    if !value.is_object() {
        return Err(ProtocolError::malformed("frame is not a JSON object", None));
    }

    let id = value.get("id").and_then(Value::as_u64);
    let wire: WireFrame =
        serde_json::from_value(value).map_err(|e| ProtocolError::malformed(e.to_string(), id))?;

    if wire.jsonrpc != JSONRPC_VERSION {
        return Err(ProtocolError::malformed(
            format!("unsupported jsonrpc version {:?}", wire.jsonrpc),
            wire.id,
        ));
    }

    match (wire.method, wire.id, wire.result, wire.error) {
        (Some(method), Some(id), None, None) => Ok(Frame::Request(Request {
            id,
            method,
            params: wire.params,
        })),
        (Some(method), None, None, None) => Ok(Frame::Notification(Notification {
            method,
            params: wire.params,
        })),
        (Some(_), id, _, _) => Err(ProtocolError::malformed(
            "request carries a result or error member",
            id,
        )),
        (None, Some(id), Some(result), None) => Ok(Frame::Response(Response {
            id,
            outcome: Ok(result),
        })),
        (None, Some(id), None, Some(error)) => Ok(Frame::Response(Response {
            id,
            outcome: Err(error),
        })),
        (None, Some(id), Some(_), Some(_)) => Err(ProtocolError::malformed(
            "response carries both result and error",
            Some(id),
        )),
        (None, Some(id), None, None) => Err(ProtocolError::malformed(
            "response carries neither result nor error",
            Some(id),
        )),
        (None, None, _, _) => Err(ProtocolError::malformed(
            "frame has neither method nor id",
            None,
        )),
    }
}

/// Reads newline-delimited frames from a buffered stream with a size cap.
///
/// Lines longer than the cap are not buffered past it: the rest of the line
/// is skipped so the next frame starts cleanly, and the oversized line is
/// reported as [`ProtocolError::FrameTooLarge`].
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
    line: Vec<u8>,
    overflow: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
            line: Vec::new(),
            overflow: 0,
        }
    }

    /// Next frame, or `Ok(None)` at end of stream.
    ///
    /// The outer `Result` is a stream failure; the inner one a single bad
    /// frame, after which reading can continue.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Result<Frame, ProtocolError>>> {
        loop {
            if !self.read_line().await? {
                return Ok(None);
            }

            let overflow = std::mem::take(&mut self.overflow);
            let line = std::mem::take(&mut self.line);

            if overflow > 0 {
                return Ok(Some(Err(ProtocolError::FrameTooLarge {
                    size: line.len() + overflow,
                    limit: self.max_frame_bytes,
                    id: peek_id(&line),
                })));
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(decode(&line)));
        }
    }

    /// Fill `self.line` with the next line. Returns false at a clean EOF.
    async fn read_line(&mut self) -> std::io::Result<bool> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(!self.line.is_empty() || self.overflow > 0);
            }

            let (chunk, consumed, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };

            let room = self.max_frame_bytes.saturating_sub(self.line.len());
            let kept = room.min(chunk.len());
            self.line.extend_from_slice(&chunk[..kept]);
            self.overflow += chunk.len() - kept;
            self.reader.consume(consumed);

            if complete {
                return Ok(true);
            }
        }
    }
}

/// Best-effort scan for a numeric `"id"` member in a truncated frame.
fn peek_id(bytes: &[u8]) -> Option<u64> {
    const KEY: &[u8] = b"\"id\"";

    let mut start = 0;
    while let Some(pos) = bytes[start..].windows(KEY.len()).position(|w| w == KEY) {
        let mut i = start + pos + KEY.len();
        while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            i += 1;
        }
        if bytes.get(i) == Some(&b':') {
            i += 1;
            while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
                i += 1;
            }
            let digits = bytes[i..].iter().take_while(|b| b.is_ascii_digit()).count();
            if digits > 0 {
                let id = std::str::from_utf8(&bytes[i..i + digits])
                    .ok()
                    .and_then(|s| s.parse().ok());
                if id.is_some() {
                    return id;
                }
            }
        }
        start += pos + 1;
    }
    None
}
