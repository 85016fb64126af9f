//! Wire protocol for client-server communication.
//!
//! Frames travel as JSON text: `{"type": "event", "channel": "...", "data": ...}`
//! for application traffic and `{"type": "ping"}` / `{"type": "pong"}` for
//! keepalive. The `channel` routes the frame; `data` is opaque to the codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close codes used by both ends of a connection.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Client gave up on a link that stopped answering pings.
    pub const KEEPALIVE_TIMEOUT: u16 = 4000;
    /// Server rejected the connection during its connect hook.
    pub const CONNECT_REJECTED: u16 = 4001;
}

/// One wire-level protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Application payload routed by channel.
    Event { channel: String, data: Value },
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Anything that failed to decode.
    Invalid,
}

/// Encoding error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid frames cannot be encoded")]
    InvalidFrame,
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialized shape of a frame. `Invalid` has no wire form.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Event {
        channel: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Ping,
    Pong,
}

impl Frame {
    /// Build an event frame.
    #[must_use]
    pub fn event(channel: impl Into<String>, data: Value) -> Self {
        Self::Event {
            channel: channel.into(),
            data,
        }
    }

    /// Whether this frame is the invalid marker.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Encode to JSON text.
    ///
    /// # Errors
    /// Returns error for [`Frame::Invalid`].
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = match self {
            Self::Event { channel, data } => WireFrame::Event {
                channel: channel.clone(),
                data: data.clone(),
            },
            Self::Ping => WireFrame::Ping,
            Self::Pong => WireFrame::Pong,
            Self::Invalid => return Err(ProtocolError::InvalidFrame),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode from raw bytes. Never fails: malformed input yields
    /// [`Frame::Invalid`].
    #[must_use]
    pub fn decode(raw: &[u8]) -> Self {
        match serde_json::from_slice::<WireFrame>(raw) {
            Ok(WireFrame::Event { channel, data }) => Self::Event { channel, data },
            Ok(WireFrame::Ping) => Self::Ping,
            Ok(WireFrame::Pong) => Self::Pong,
            Err(e) => {
                tracing::debug!(error = %e, len = raw.len(), "Dropping undecodable frame");
                Self::Invalid
            }
        }
    }

    /// Decode from text.
    #[must_use]
    pub fn decode_str(raw: &str) -> Self {
        Self::decode(raw.as_bytes())
    }
}
