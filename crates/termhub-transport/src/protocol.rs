//! Wire protocol for buffer clients.
//!
//! Control messages are JSON text frames. Buffer updates are binary frames:
//!
//! ```text
//! 0xBF | u32 LE session id length | session id (UTF-8) | encoded snapshot
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use termhub_core::SessionId;
use thiserror::Error;

/// First byte of every binary buffer frame.
pub const BUFFER_MAGIC: u8 = 0xBF;

/// Protocol version announced in the welcome message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientControl {
    /// Start receiving frames for a session.
    Subscribe { session_id: SessionId },
    /// Stop receiving frames for a session.
    Unsubscribe { session_id: SessionId },
    /// Keepalive.
    Ping,
}

impl ClientControl {
    /// Serialize for sending upstream. Infallible for this enum.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once right after the socket opens.
    Connected { version: String },
    /// A subscribe request succeeded.
    Subscribed { session_id: SessionId },
    /// A request failed, or a subscription was lost.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
    /// Pong response, with server time in milliseconds since the epoch.
    Pong { timestamp: i64 },
}

impl ServerMessage {
    #[must_use]
    pub fn welcome() -> Self {
        Self::Connected {
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn session_error(session_id: &str, message: impl Into<String>) -> Self {
        Self::Error {
            session_id: Some(session_id.to_string()),
            message: message.into(),
        }
    }
}

/// Anything queued for a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

impl From<&ServerMessage> for Outbound {
    fn from(message: &ServerMessage) -> Self {
        Self::Text(serde_json::to_string(message).unwrap_or_default())
    }
}

impl From<ServerMessage> for Outbound {
    fn from(message: ServerMessage) -> Self {
        Self::from(&message)
    }
}

/// Binary frame parsing error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short")]
    Truncated,
    #[error("Bad frame magic: {0:#04x}")]
    BadMagic(u8),
    #[error("Session id is not valid UTF-8")]
    InvalidSessionId,
}

/// Wrap an encoded snapshot for a session.
#[must_use]
pub fn encode_frame(session_id: &str, payload: &[u8]) -> Bytes {
    let id = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(5 + id.len() + payload.len());
    buf.put_u8(BUFFER_MAGIC);
    buf.put_u32_le(u32::try_from(id.len()).unwrap_or(u32::MAX));
    buf.put_slice(id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a frame into its session id and payload.
///
/// # Errors
/// Returns a `FrameError` if the frame is malformed.
pub fn decode_frame(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    let (&magic, rest) = frame.split_first().ok_or(FrameError::Truncated)?;
    if magic != BUFFER_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if rest.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let (len, rest) = rest.split_at(4);
    let len = usize::try_from(u32::from_le_bytes([len[0], len[1], len[2], len[3]]))
        .map_err(|_| FrameError::Truncated)?;
    if rest.len() < len {
        return Err(FrameError::Truncated);
    }
    let (id, payload) = rest.split_at(len);
    let id = std::str::from_utf8(id).map_err(|_| FrameError::InvalidSessionId)?;
    Ok((id, payload))
}
