//! JSON wire protocol.
//!
//! Every frame is a JSON object with a mandatory `type` discriminator:
//! ```text
//! client → server   init · openFile · codeUpdate · operation · saveFile · status_update
//! server → client   solo_mode · connected · error · fileData · update · operation · saved
//!                   user_joined · user_left · user_status_changed · file_opened
//! ```
//!
//! Operations travel as mixed step arrays, see [`codesync_core::Operation`].

use codesync_core::Operation;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{Member, MemberStatus};

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake: pick solo or collaborative mode.
    #[serde(rename = "init")]
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, rename = "authToken", skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },

    #[serde(rename = "openFile")]
    OpenFile {
        #[serde(rename = "fileId")]
        file_id: String,
    },

    /// Whole-content replacement.
    #[serde(rename = "codeUpdate")]
    CodeUpdate {
        #[serde(rename = "fileId")]
        file_id: String,
        content: String,
    },

    /// Incremental edit (collaborative mode only).
    #[serde(rename = "operation")]
    Operation {
        #[serde(rename = "fileId")]
        file_id: String,
        operation: Operation,
        #[serde(default)]
        revision: u64,
    },

    #[serde(rename = "saveFile")]
    SaveFile {
        #[serde(rename = "fileId")]
        file_id: String,
    },

    #[serde(rename = "status_update")]
    StatusUpdate { status: MemberStatus },
}

impl ClientMessage {
    /// Wire names of every inbound message type.
    pub const KINDS: &'static [&'static str] = &[
        "init",
        "openFile",
        "codeUpdate",
        "operation",
        "saveFile",
        "status_update",
    ];

    /// Decode a text frame, telling malformed JSON, unknown types and bad
    /// payloads apart.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        if !Self::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::OpenFile { .. } => "openFile",
            Self::CodeUpdate { .. } => "codeUpdate",
            Self::Operation { .. } => "operation",
            Self::SaveFile { .. } => "saveFile",
            Self::StatusUpdate { .. } => "status_update",
        }
    }

    pub fn init(token: Option<&str>) -> Self {
        Self::Init {
            token: token.map(str::to_string),
            auth_token: None,
        }
    }

    pub fn open_file(file_id: impl Into<String>) -> Self {
        Self::OpenFile { file_id: file_id.into() }
    }

    pub fn code_update(file_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::CodeUpdate {
            file_id: file_id.into(),
            content: content.into(),
        }
    }

    pub fn operation(file_id: impl Into<String>, operation: Operation, revision: u64) -> Self {
        Self::Operation {
            file_id: file_id.into(),
            operation,
            revision,
        }
    }

    pub fn save_file(file_id: impl Into<String>) -> Self {
        Self::SaveFile { file_id: file_id.into() }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "solo_mode")]
    SoloMode { message: String },

    #[serde(rename = "connected")]
    Connected {
        repository: String,
        user_id: Uuid,
        users: Vec<Member>,
    },

    #[serde(rename = "error")]
    Error { message: String },

    /// Content of an opened file, with the server revision it reflects.
    #[serde(rename = "fileData")]
    FileData {
        #[serde(rename = "fileId")]
        file_id: String,
        content: String,
        #[serde(default)]
        revision: u64,
    },

    /// Whole-content replacement by another client.
    #[serde(rename = "update")]
    Update {
        #[serde(rename = "fileId")]
        file_id: String,
        content: String,
        #[serde(default)]
        revision: u64,
    },

    /// An applied edit; `revision` is the server revision after it.
    #[serde(rename = "operation")]
    Operation {
        #[serde(rename = "fileId")]
        file_id: String,
        operation: Operation,
        revision: u64,
    },

    #[serde(rename = "saved")]
    Saved {
        #[serde(rename = "fileId")]
        file_id: String,
    },

    #[serde(rename = "user_joined")]
    UserJoined { user: Member },

    #[serde(rename = "user_left")]
    UserLeft {
        user_id: Uuid,
        username: String,
        remaining_users: Vec<Member>,
    },

    #[serde(rename = "user_status_changed")]
    UserStatusChanged { user: Member },

    #[serde(rename = "file_opened")]
    FileOpened { user_id: Uuid, file_id: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn solo_mode(message: impl Into<String>) -> Self {
        Self::SoloMode { message: message.into() }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SoloMode { .. } => "solo_mode",
            Self::Connected { .. } => "connected",
            Self::Error { .. } => "error",
            Self::FileData { .. } => "fileData",
            Self::Update { .. } => "update",
            Self::Operation { .. } => "operation",
            Self::Saved { .. } => "saved",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserStatusChanged { .. } => "user_status_changed",
            Self::FileOpened { .. } => "file_opened",
        }
    }
}

/// Protocol errors. Logged and answered with an `error` frame; the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid '{kind}' message: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("'{kind}' is not allowed {state}")]
    NotAllowed { kind: &'static str, state: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
