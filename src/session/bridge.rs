//! Protocol sidecar bridge
//!
//! Talks to an external protocol sidecar over a WebSocket. The sidecar holds
//! the actual protocol session; this side only exchanges JSON frames:
//!
//! ```text
//! hub ──init / send / pairing-code / close──▶ sidecar
//! hub ◀──connection-update / creds-update / messages-upsert / result── sidecar
//! ```
//!
//! Requests are correlated by `requestId` through a pending map; each waits
//! for its `result` frame up to the request timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{
    CredentialBlob, ProtocolClient, ProtocolConnector, RawConnection, RawMessage, RawProtocolEvent,
};
use crate::error::{ConnectError, PairingError, SendError};
use crate::payload::{Button, Media, MediaKind, OutboundPayload};

// =============================================================================
// Wire frames
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMedia {
    pub kind: MediaKind,
    /// Base64 encoded bytes
    pub data: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl From<&Media> for WireMedia {
    fn from(media: &Media) -> Self {
        Self {
            kind: media.kind,
            data: base64::Engine::encode(&general_purpose::STANDARD, &media.bytes),
            mime_type: media.mime_type.clone(),
            caption: media.caption.clone(),
            file_name: media.file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireContent {
    Text {
        text: String,
    },
    Media {
        media: WireMedia,
    },
    Buttons {
        text: String,
        buttons: Vec<Button>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<WireMedia>,
    },
}

impl From<&OutboundPayload> for WireContent {
    fn from(payload: &OutboundPayload) -> Self {
        match payload {
            OutboundPayload::Text(text) => Self::Text { text: text.clone() },
            OutboundPayload::Media(media) => Self::Media {
                media: media.into(),
            },
            OutboundPayload::Buttons {
                text,
                buttons,
                media,
            } => Self::Buttons {
                text: text.clone(),
                buttons: buttons.clone(),
                media: media.as_ref().map(WireMedia::from),
            },
        }
    }
}

/// Frames sent to the sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Init {
        /// Base64 credential blob, absent for a fresh login
        credentials: Option<String>,
    },
    Send {
        request_id: u64,
        jid: String,
        content: WireContent,
    },
    PairingCode {
        request_id: u64,
        phone: String,
    },
    Close,
}

/// Frames received from the sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<RawConnection>,
        #[serde(default)]
        qr: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
    },
    CredsUpdate {
        credentials: String,
    },
    MessagesUpsert {
        messages: Vec<RawMessage>,
    },
    Result {
        request_id: u64,
        ok: bool,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

// =============================================================================
// Pending request tracking
// =============================================================================

type RequestOutcome = Result<Option<String>, String>;

struct PendingRequest {
    tx: oneshot::Sender<RequestOutcome>,
    created_at: Instant,
}

/// Work for the writer task
enum WriterCommand {
    Frame(OutboundFrame),
    /// Write `close`, shut the socket, then acknowledge
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
enum RequestFailure {
    Rejected(String),
    Timeout,
    Disconnected,
}

// =============================================================================
// Connector
// =============================================================================

/// Connector that reaches the protocol session through a sidecar WebSocket
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    url: String,
    request_timeout: Duration,
    debug_mode: bool,
}

impl BridgeConnector {
    pub fn new(url: impl Into<String>, request_timeout: Duration, debug_mode: bool) -> Self {
        Self {
            url: url.into(),
            request_timeout,
            debug_mode,
        }
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn connect(
        &self,
        credentials: Option<CredentialBlob>,
        events: mpsc::UnboundedSender<RawProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, ConnectError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectError::Transport(format!("{}: {}", self.url, e)))?;
        info!("🔌 Connected to protocol sidecar at {}", self.url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let init = OutboundFrame::Init {
            credentials: credentials
                .map(|blob| base64::Engine::encode(&general_purpose::STANDARD, &blob.0)),
        };
        let json = serde_json::to_string(&init)
            .map_err(|e| ConnectError::Transport(format!("encode init: {}", e)))?;
        ws_tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectError::Transport(format!("send init: {}", e)))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let pending: Arc<DashMap<u64, PendingRequest>> = Arc::new(DashMap::new());
        let debug_mode = self.debug_mode;

        // Task to send outgoing frames; runs until the queue is closed or drained
        tokio::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                match command {
                    WriterCommand::Frame(frame) => {
                        if !write_frame(&mut ws_tx, &frame).await {
                            return;
                        }
                    }
                    WriterCommand::Close(done) => {
                        if !write_frame(&mut ws_tx, &OutboundFrame::Close).await {
                            debug!("Sidecar socket gone before close frame");
                        }
                        let _ = ws_tx.close().await;
                        let _ = done.send(());
                        return;
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        // Task to receive sidecar frames
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if debug_mode {
                            debug!("Sidecar frame: {}", text.as_str());
                        }
                        match serde_json::from_str::<InboundFrame>(text.as_str()) {
                            Ok(frame) => {
                                if !route_frame(frame, &events, &reader_pending) {
                                    break;
                                }
                            }
                            Err(e) => warn!("Failed to parse sidecar frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Protocol sidecar closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Sidecar WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Losing the sidecar is a transient close of the session
            reader_pending.clear();
            let _ = events.send(RawProtocolEvent::ConnectionUpdate {
                connection: Some(RawConnection::Close),
                qr: None,
                status_code: None,
            });
        });

        Ok(Arc::new(BridgeClient {
            outbound: out_tx,
            pending,
            next_request_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
            reader,
        }))
    }
}

/// Encode and write one frame; false once the socket is unusable
async fn write_frame<S>(ws_tx: &mut S, frame: &OutboundFrame) -> bool
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode sidecar frame: {}", e);
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Dispatch one sidecar frame; returns false once the event receiver is gone
fn route_frame(
    frame: InboundFrame,
    events: &mpsc::UnboundedSender<RawProtocolEvent>,
    pending: &DashMap<u64, PendingRequest>,
) -> bool {
    let raw = match frame {
        InboundFrame::ConnectionUpdate {
            connection,
            qr,
            status_code,
        } => RawProtocolEvent::ConnectionUpdate {
            connection,
            qr,
            status_code,
        },
        InboundFrame::CredsUpdate { credentials } => {
            match base64::Engine::decode(&general_purpose::STANDARD, credentials.as_bytes()) {
                Ok(bytes) => RawProtocolEvent::CredsUpdate(CredentialBlob(bytes)),
                Err(e) => {
                    warn!("Discarding undecodable credential update: {}", e);
                    return true;
                }
            }
        }
        InboundFrame::MessagesUpsert { messages } => RawProtocolEvent::MessagesUpsert(messages),
        InboundFrame::Result {
            request_id,
            ok,
            value,
            error,
        } => {
            complete_request(pending, request_id, ok, value, error);
            return true;
        }
    };

    events.send(raw).is_ok()
}

fn complete_request(
    pending: &DashMap<u64, PendingRequest>,
    request_id: u64,
    ok: bool,
    value: Option<String>,
    error: Option<String>,
) {
    let Some((_, request)) = pending.remove(&request_id) else {
        warn!("No pending request found for id {}", request_id);
        return;
    };

    let outcome = if ok {
        Ok(value)
    } else {
        Err(error.unwrap_or_else(|| "unknown error".to_string()))
    };
    if request.tx.send(outcome).is_err() {
        debug!("Requester for {} already gave up", request_id);
    }
}

// =============================================================================
// Client
// =============================================================================

struct BridgeClient {
    outbound: mpsc::UnboundedSender<WriterCommand>,
    pending: Arc<DashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeClient {
    async fn request(
        &self,
        build: impl FnOnce(u64) -> OutboundFrame,
    ) -> Result<Option<String>, RequestFailure> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id,
            PendingRequest {
                tx,
                created_at: Instant::now(),
            },
        );
        self.cleanup_old_pending();

        if self
            .outbound
            .send(WriterCommand::Frame(build(request_id)))
            .is_err()
        {
            self.pending.remove(&request_id);
            return Err(RequestFailure::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(RequestFailure::Rejected(reason)),
            Ok(Err(_)) => Err(RequestFailure::Disconnected),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(RequestFailure::Timeout)
            }
        }
    }

    /// Drop pending requests that outlived two timeouts
    fn cleanup_old_pending(&self) {
        let now = Instant::now();
        let max_age = self.request_timeout * 2;

        self.pending
            .retain(|_, pending| now.duration_since(pending.created_at) < max_age);
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn send_message(&self, jid: &str, payload: &OutboundPayload) -> Result<(), SendError> {
        let content = WireContent::from(payload);
        self.request(|request_id| OutboundFrame::Send {
            request_id,
            jid: jid.to_string(),
            content,
        })
        .await
        .map(|_| ())
        .map_err(|failure| match failure {
            RequestFailure::Rejected(reason) => SendError::Rejected(reason),
            RequestFailure::Timeout => SendError::Timeout,
            RequestFailure::Disconnected => SendError::NotConnected,
        })
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError> {
        let value = self
            .request(|request_id| OutboundFrame::PairingCode {
                request_id,
                phone: phone_number.to_string(),
            })
            .await
            .map_err(|failure| match failure {
                RequestFailure::Rejected(reason) => PairingError::Rejected(reason),
                RequestFailure::Timeout => {
                    PairingError::Rejected("timed out waiting for pairing code".to_string())
                }
                RequestFailure::Disconnected => PairingError::NotConnected,
            })?;

        value.ok_or_else(|| PairingError::Rejected("sidecar returned no code".to_string()))
    }

    /// Returns once `close` is on the wire (or the socket is already gone)
    async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.outbound.send(WriterCommand::Close(done_tx)).is_err() {
            debug!("Sidecar writer already stopped");
            return;
        }
        if tokio::time::timeout(self.request_timeout, done_rx)
            .await
            .is_err()
        {
            warn!("Timed out delivering close frame to the sidecar");
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        // The writer drains its queue and shuts the socket once `outbound` drops
        self.reader.abort();
    }
}
