//! Scripted protocol connector and observer helpers shared by integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use wa_session_hub::error::{ConnectError, PairingError, SendError};
use wa_session_hub::payload::OutboundPayload;
use wa_session_hub::session::{
    CredentialBlob, ProtocolClient, ProtocolConnector, RawConnection, RawMessage,
    RawProtocolEvent,
};
use wa_session_hub::{Hub, HubConfig, ObserverId, ServerEvent, SessionState};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Connector whose sessions are driven by the test
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    sessions: Mutex<Vec<mpsc::UnboundedSender<RawProtocolEvent>>>,
    pub sent: Arc<Mutex<Vec<(String, OutboundPayload)>>>,
    pub failing_jids: Arc<Mutex<HashSet<String>>>,
    pub transport_down: AtomicBool,
    /// Latency added to every send, in milliseconds
    pub send_delay_ms: Arc<AtomicU64>,
    pub closed: Arc<AtomicUsize>,
    pub seen_credentials: Mutex<Vec<Option<CredentialBlob>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push a raw event into the most recent session
    pub fn emit(&self, event: RawProtocolEvent) {
        let sessions = self.sessions.lock();
        let tx = sessions.last().expect("no session has been connected");
        tx.send(event).expect("session event stream closed");
    }

    pub fn emit_qr(&self, data: &str) {
        self.emit(RawProtocolEvent::ConnectionUpdate {
            connection: None,
            qr: Some(data.to_string()),
            status_code: None,
        });
    }

    pub fn emit_open(&self) {
        self.emit(RawProtocolEvent::ConnectionUpdate {
            connection: Some(RawConnection::Open),
            qr: None,
            status_code: None,
        });
    }

    pub fn emit_close(&self, status_code: u16) {
        self.emit(RawProtocolEvent::ConnectionUpdate {
            connection: Some(RawConnection::Close),
            qr: None,
            status_code: Some(status_code),
        });
    }

    pub fn emit_text(&self, from: &str, text: &str) {
        self.emit(RawProtocolEvent::MessagesUpsert(vec![RawMessage {
            remote_jid: from.to_string(),
            conversation: Some(text.to_string()),
            timestamp: 1_700_000_000,
            ..Default::default()
        }]));
    }

    pub fn fail_sends_to(&self, jid: &str) {
        self.failing_jids.lock().insert(jid.to_string());
    }

    pub fn slow_sends(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: Option<CredentialBlob>,
        events: mpsc::UnboundedSender<RawProtocolEvent>,
    ) -> Result<Arc<dyn ProtocolClient>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.transport_down.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport("sidecar offline".to_string()));
        }

        self.seen_credentials.lock().push(credentials);
        self.sessions.lock().push(events);

        Ok(Arc::new(FakeClient {
            sent: self.sent.clone(),
            failing_jids: self.failing_jids.clone(),
            send_delay_ms: self.send_delay_ms.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct FakeClient {
    sent: Arc<Mutex<Vec<(String, OutboundPayload)>>>,
    failing_jids: Arc<Mutex<HashSet<String>>>,
    send_delay_ms: Arc<AtomicU64>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn send_message(&self, jid: &str, payload: &OutboundPayload) -> Result<(), SendError> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_jids.lock().contains(jid) {
            return Err(SendError::Rejected("recipient not on network".to_string()));
        }
        self.sent.lock().push((jid.to_string(), payload.clone()));
        Ok(())
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError> {
        if phone_number.chars().all(|c| c.is_ascii_digit()) {
            Ok("ABCD-1234".to_string())
        } else {
            Err(PairingError::Rejected("invalid phone number".to_string()))
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config(session_dir: &std::path::Path) -> HubConfig {
    HubConfig {
        session_dir: session_dir.to_path_buf(),
        reconnect_delay_secs: 0,
        history_capacity: 50,
        observer_buffer: 256,
        ..HubConfig::default()
    }
}

/// Hub with a short, sub-second reconnect delay
pub fn start_hub(
    session_dir: &std::path::Path,
    connector: Arc<FakeConnector>,
    retry_delay: Duration,
) -> Hub {
    let config = test_config(session_dir);
    Hub::start_with_retry_delay(&config, connector, retry_delay)
}

/// In-process observer
pub struct Observer {
    pub id: ObserverId,
    pub rx: mpsc::Receiver<ServerEvent>,
}

impl Observer {
    pub fn join(hub: &Hub) -> Self {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(256);
        hub.dispatcher.join(id, tx);
        Self { id, rx }
    }

    /// Wait for the first event matching `pred`, skipping the rest
    pub async fn expect<F>(&mut self, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        timeout(TIMEOUT, async {
            loop {
                let event = self.rx.recv().await.expect("observer channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub async fn expect_state(&mut self, status: SessionState) -> ServerEvent {
        self.expect(|e| matches!(e, ServerEvent::ConnectionState { status: s, .. } if *s == status))
            .await
    }

    /// Drain whatever is queued right now
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn wait_for_state(hub: &Hub, state: SessionState) {
    let mut rx = hub.manager.subscribe_state();
    timeout(TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
        .expect("manager stopped");
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Bring a session to Open through the QR path
pub async fn open_session(hub: &Hub, connector: &FakeConnector) {
    hub.manager.start(None);
    wait_for_state(hub, SessionState::Starting).await;
    wait_until(|| hub.session.is_live()).await;
    connector.emit_qr("2@qr-one");
    wait_for_state(hub, SessionState::AwaitingQr).await;
    connector.emit_open();
    wait_for_state(hub, SessionState::Open).await;
}
