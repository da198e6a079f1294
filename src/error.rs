//! Error types for the session hub
//!
//! Each boundary gets its own enum so callers can tell a rejected payload
//! from a failed send or a broken credential directory.

use std::path::PathBuf;

/// Credential directory errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to read credentials at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write credentials at {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to establish a protocol session
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Credential material could not be loaded; retried on next explicit start only
    #[error("Credential load failed: {0}")]
    Credentials(#[from] CredentialError),

    /// The protocol session could not be reached; treated as a transient disconnect
    #[error("Protocol transport unavailable: {0}")]
    Transport(String),
}

/// Per-command send failure, reported to the requesting observer only
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Send rejected: {0}")]
    Rejected(String),

    #[error("Timed out waiting for the protocol session")]
    Timeout,
}

/// Pairing-code request failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Pairing code request rejected: {0}")]
    Rejected(String),

    #[error("Session closed before a pairing code was issued")]
    Aborted,
}

/// Malformed observer input, rejected before it reaches the session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid data URL")]
    InvalidDataUrl,

    #[error("Invalid base64 media payload")]
    InvalidBase64,

    #[error("Media payload needs a mime type")]
    MissingMimeType,

    #[error("Media too large: {size} bytes (max: {max})")]
    MediaTooLarge { size: usize, max: usize },

    #[error("Recipient must not be empty")]
    EmptyRecipient,

    #[error("Recipient list must not be empty")]
    NoRecipients,

    #[error("Invalid buttons: {0}")]
    InvalidButtons(String),

    #[error("Auto-reply keyword must not be empty")]
    EmptyKeyword,
}
