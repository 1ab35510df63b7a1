//! Wire protocol for the collaboration gateway.
//!
//! Control traffic is JSON text frames with a `{type: ...}` envelope;
//! kebab-case types, camelCase fields. CRDT update bytes travel base64-coded
//! inside JSON, or raw inside the compact binary frame form (see [`framing`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod framing;

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    BadControlFrame(#[from] serde_json::Error),

    #[error("malformed binary frame: {0}")]
    BadBinaryFrame(String),
}

/// The closed set of error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    AuthInvalid,
    AuthExpired,
    DocumentNotFound,
    InsufficientPermissions,
    JoinFailed,
    InvalidUpdateData,
    UpdateProcessingError,
    SlowConsumer,
    ProtocolError,
    Unavailable,
    ShuttingDown,
}

impl ErrorCode {
    /// Wire spelling, e.g. `INVALID_UPDATE_DATA`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::AuthExpired => "AUTH_EXPIRED",
            ErrorCode::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::JoinFailed => "JOIN_FAILED",
            ErrorCode::InvalidUpdateData => "INVALID_UPDATE_DATA",
            ErrorCode::UpdateProcessingError => "UPDATE_PROCESSING_ERROR",
            ErrorCode::SlowConsumer => "SLOW_CONSUMER",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// WebSocket close code for sessions terminated with this error.
    pub fn close_code(self) -> u16 {
        match self {
            ErrorCode::AuthRequired | ErrorCode::AuthInvalid | ErrorCode::AuthExpired => 4001,
            ErrorCode::DocumentNotFound => 4004,
            ErrorCode::InsufficientPermissions => 4003,
            ErrorCode::JoinFailed | ErrorCode::Unavailable => 4010,
            ErrorCode::InvalidUpdateData | ErrorCode::UpdateProcessingError => 4007,
            ErrorCode::SlowConsumer => 4008,
            ErrorCode::ProtocolError => 4002,
            ErrorCode::ShuttingDown => 4012,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document metadata as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Roster entry for a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub principal_id: String,
    pub display_name: String,
    pub role: String,
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinDocument {
        document_id: String,
    },
    LeaveDocument {
        document_id: String,
    },
    DocumentUpdate {
        document_id: String,
        #[serde(with = "b64")]
        update: Vec<u8>,
    },
    CursorUpdate {
        document_id: String,
        cursor: serde_json::Value,
    },
    Logout,
    Ping,
}

/// Frames the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Authenticated {
        principal_id: String,
        display_name: String,
        role: String,
        permissions: Vec<String>,
    },
    AuthError {
        code: ErrorCode,
        message: String,
    },
    DocumentJoined {
        document_id: String,
        metadata: DocumentSummary,
        has_write_access: bool,
        users: Vec<PeerInfo>,
        #[serde(with = "b64")]
        document_state: Vec<u8>,
    },
    DocumentLeft {
        document_id: String,
    },
    DocumentUpdate {
        document_id: String,
        origin_principal_id: String,
        #[serde(with = "b64")]
        update: Vec<u8>,
        seq: u64,
    },
    DocumentUpdateAck {
        document_id: String,
        seq: u64,
    },
    CursorUpdate {
        document_id: String,
        principal_id: String,
        cursor: serde_json::Value,
    },
    UserJoined {
        document_id: String,
        user: PeerInfo,
    },
    UserLeft {
        document_id: String,
        principal_id: String,
    },
    AccessChanged {
        document_id: String,
        has_write_access: bool,
    },
    AccessRevoked {
        document_id: String,
        reason: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    ShuttingDown,
    Pong,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        // The enum contains nothing unserializable; failure here is a bug.
        serde_json::to_string(self).expect("server message serializes")
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
