//! Line-delimited JSON-RPC 2.0 framing used on an integration's stdio.
//!
//! Every message is one JSON object terminated by `\n`. Requests and
//! notifications share the `method`/`params` shape and differ only in the
//! presence of `id`; responses carry exactly one of `result` or `error`.

mod codec;
mod frame;

use thiserror::Error;

pub use codec::{decode, encode, FrameReader, DEFAULT_MAX_FRAME_BYTES};
pub use frame::{Frame, Notification, Request, Response, RpcErrorObject, JSONRPC_VERSION};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String, id: Option<u64> },

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        size: usize,
        limit: usize,
        id: Option<u64>,
    },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>, id: Option<u64>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
            id,
        }
    }

    /// Request id the bad frame was answering, when it could be recovered.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::MalformedFrame { id, .. } | Self::FrameTooLarge { id, .. } => *id,
            Self::Encode(_) => None,
        }
    }
}
