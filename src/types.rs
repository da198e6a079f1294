//! Observer wire protocol and shared records

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::SessionState;

/// Identifier assigned to an observer when it connects
pub type ObserverId = Uuid;

// =============================================================================
// History
// =============================================================================

/// Outcome recorded for an outbound message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryStatus {
    Sent,
    SentButton,
    AutoReply,
    Failed,
}

/// One row of outbound activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Recipient as the observer typed it (or the sender JID for auto replies)
    pub recipient: String,
    pub text: String,
    pub status: HistoryStatus,
}

impl HistoryEntry {
    pub fn new(recipient: impl Into<String>, text: impl Into<String>, status: HistoryStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            recipient: recipient.into(),
            text: text.into(),
            status,
        }
    }
}

// =============================================================================
// Auto replies and inbound messages
// =============================================================================

/// Keyword triggered reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoReplyRule {
    pub keyword: String,
    pub reply: String,
}

/// Inbound message after normalization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Sender JID
    pub from: String,
    pub text: String,
    pub has_media: bool,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

// =============================================================================
// Command payload pieces
// =============================================================================

/// Quick-reply button as sent by an observer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
}

/// Media attachment as sent by an observer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInput {
    /// `data:<mime>;base64,<payload>` URL, or raw base64 with `mime_type` set
    pub media_bytes: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Kind of acknowledged action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SentKind {
    SingleText,
    SingleMedia,
    SingleButtons,
    Broadcast,
    AutoReply,
}

// =============================================================================
// Observer Protocol
// =============================================================================

/// Commands sent by an observer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Begin a session, or re-report the current one
    StartSession,
    /// Close the current session and cancel any pending reconnect
    StopSession,
    RequestPairing {
        phone_number: String,
    },
    SendText {
        to: String,
        text: String,
    },
    SendMedia {
        to: String,
        media_bytes: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    SendButtons {
        to: String,
        text: String,
        buttons: Vec<ButtonSpec>,
        #[serde(default)]
        media: Option<MediaInput>,
    },
    SendBroadcast {
        to: Vec<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        media: Option<MediaInput>,
        #[serde(default)]
        buttons: Vec<ButtonSpec>,
    },
    SetAutoReply {
        keyword: String,
        reply: String,
    },
    ListAutoReplies,
    Ping,
}

/// Events pushed to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Qr {
        data: String,
    },
    PairingCode {
        code: String,
    },
    ConnectionState {
        status: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause_code: Option<u16>,
        #[serde(default)]
        logged_out: bool,
    },
    /// Full history snapshot, never a diff
    History {
        entries: Arc<Vec<HistoryEntry>>,
    },
    SentOk {
        kind: SentKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivered: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed: Option<usize>,
    },
    Error {
        message: String,
    },
    InboundMessage(InboundMessage),
    AutoReplies {
        rules: Vec<AutoReplyRule>,
    },
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn sent_ok(kind: SentKind) -> Self {
        Self::SentOk {
            kind,
            delivered: None,
            failed: None,
        }
    }

    pub fn state(status: SessionState) -> Self {
        Self::ConnectionState {
            status,
            cause_code: None,
            logged_out: false,
        }
    }
}
