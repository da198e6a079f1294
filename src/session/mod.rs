//! Protocol session ownership
//!
//! [`SessionConnection`] owns the single live protocol handle. It loads
//! credential material, asks a [`ProtocolConnector`] for a session, saves
//! credential updates, and turns the raw event stream into the closed
//! [`SessionEvent`] vocabulary the rest of the crate works with.

pub mod bridge;
pub mod credentials;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{ConnectError, PairingError, SendError};
use crate::payload::OutboundPayload;
use crate::types::InboundMessage;

pub use credentials::{CredentialBlob, CredentialStore};

/// Disconnect status code meaning the device was logged out
pub const LOGGED_OUT_STATUS: u16 = 401;

// =============================================================================
// Protocol seam
// =============================================================================

/// Builds protocol sessions
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Construct a session from stored credentials (or fresh when `None`).
    /// Raw events for this session flow into `events` until it ends.
    async fn connect(
        &self,
        credentials: Option<CredentialBlob>,
        events: mpsc::UnboundedSender<RawProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, ConnectError>;
}

/// A live protocol session
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn send_message(&self, jid: &str, payload: &OutboundPayload) -> Result<(), SendError>;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError>;

    /// End the session without invalidating credentials
    async fn close(&self);
}

// =============================================================================
// Raw events (as reported by the protocol session)
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RawConnection {
    Connecting,
    Open,
    Close,
}

/// Inbound message in the protocol session's own shape
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    /// Plain conversation body
    #[serde(default)]
    pub conversation: Option<String>,
    /// Body of an extended (quoted / link preview) text message
    #[serde(default)]
    pub extended_text: Option<String>,
    /// Set when the message carries an attachment
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl RawMessage {
    fn has_content(&self) -> bool {
        self.conversation.is_some() || self.extended_text.is_some() || self.media_type.is_some()
    }
}

/// Heterogeneous event shapes emitted by the protocol session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawProtocolEvent {
    ConnectionUpdate {
        connection: Option<RawConnection>,
        qr: Option<String>,
        status_code: Option<u16>,
    },
    CredsUpdate(CredentialBlob),
    MessagesUpsert(Vec<RawMessage>),
}

// =============================================================================
// Normalized events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    QrReceived(String),
    PairingCodeReceived(String),
    ConnectionOpened,
    ConnectionClosed {
        cause_code: Option<u16>,
        is_logout: bool,
    },
    InboundMessage(InboundMessage),
}

/// Translate one raw event; credential updates are handled before this point
pub fn normalize(raw: RawProtocolEvent) -> Vec<SessionEvent> {
    match raw {
        RawProtocolEvent::ConnectionUpdate {
            connection,
            qr,
            status_code,
        } => {
            let mut events = Vec::new();
            if let Some(qr) = qr {
                events.push(SessionEvent::QrReceived(qr));
            }
            match connection {
                Some(RawConnection::Open) => events.push(SessionEvent::ConnectionOpened),
                Some(RawConnection::Close) => events.push(SessionEvent::ConnectionClosed {
                    cause_code: status_code,
                    is_logout: status_code == Some(LOGGED_OUT_STATUS),
                }),
                Some(RawConnection::Connecting) | None => {}
            }
            events
        }
        RawProtocolEvent::MessagesUpsert(messages) => messages
            .into_iter()
            .filter(|m| !m.from_me && m.has_content())
            .map(|m| {
                SessionEvent::InboundMessage(InboundMessage {
                    text: m.conversation.or(m.extended_text).unwrap_or_default(),
                    has_media: m.media_type.is_some(),
                    from: m.remote_jid,
                    timestamp: m.timestamp,
                })
            })
            .collect(),
        RawProtocolEvent::CredsUpdate(_) => Vec::new(),
    }
}

// =============================================================================
// Session connection
// =============================================================================

/// Result of a successful `connect()`
pub struct SessionHandle {
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Owner of the single protocol session handle
pub struct SessionConnection {
    connector: Arc<dyn ProtocolConnector>,
    credentials: CredentialStore,
    live: RwLock<Option<Arc<dyn ProtocolClient>>>,
}

impl SessionConnection {
    pub fn new(connector: Arc<dyn ProtocolConnector>, credentials: CredentialStore) -> Self {
        Self {
            connector,
            credentials,
            live: RwLock::new(None),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Load credentials and construct a protocol session.
    ///
    /// The returned handle is not live until [`install`](Self::install)ed.
    pub async fn connect(&self) -> Result<SessionHandle, ConnectError> {
        let stored = self.credentials.load().await?;
        info!(
            "🔐 Connecting protocol session ({})",
            if stored.is_some() {
                "stored credentials"
            } else {
                "fresh login"
            }
        );

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let client = self.connector.connect(stored, raw_tx).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(raw_rx, tx, self.credentials.clone()));

        Ok(SessionHandle { client, events: rx })
    }

    /// Make a connected client the live handle
    pub fn install(&self, client: Arc<dyn ProtocolClient>) {
        *self.live.write() = Some(client);
    }

    /// Forget the live handle
    pub fn clear(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.live.write().take()
    }

    pub fn live(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.live.read().clone()
    }

    pub fn is_live(&self) -> bool {
        self.live.read().is_some()
    }

    /// Forward an outbound message. History logging is the caller's job.
    pub async fn send(&self, jid: &str, payload: &OutboundPayload) -> Result<(), SendError> {
        let client = self.live().ok_or(SendError::NotConnected)?;
        client.send_message(jid, payload).await
    }

    pub async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError> {
        let client = self.live().ok_or(PairingError::NotConnected)?;
        client.request_pairing_code(phone_number).await
    }
}

/// Save credential updates and forward everything else normalized
async fn pump_events(
    mut raw_rx: mpsc::UnboundedReceiver<RawProtocolEvent>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    credentials: CredentialStore,
) {
    while let Some(raw) = raw_rx.recv().await {
        if let RawProtocolEvent::CredsUpdate(blob) = &raw {
            if let Err(e) = credentials.save(blob).await {
                error!("Failed to persist credential update: {}", e);
            }
            continue;
        }

        for event in normalize(raw) {
            if tx.send(event).is_err() {
                debug!("Session event receiver dropped, stopping pump");
                return;
            }
        }
    }
    debug!("Protocol event stream ended");
}
