//! Connection manager
//!
//! A single task owns [`SessionState`]. Observer start/stop/pairing requests,
//! protocol events, connect completions and retry timers all arrive through
//! one inbox and are handled one at a time, so no two handlers ever race on
//! the state. Slow work (credential load, handshake, pairing, close) is
//! spawned and re-enters the inbox when done.
//!
//! Every connect attempt gets a number. Anything tagged with a superseded
//! attempt (late events, late connect results, late timers) is discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, PairingError};
use crate::fanout::Fanout;
use crate::session::{SessionConnection, SessionEvent, SessionHandle};
use crate::state::{Effect, SessionState, Trigger};
use crate::types::{InboundMessage, ObserverId, ServerEvent};

/// Messages handled by the manager task
enum Input {
    Start {
        requester: Option<ObserverId>,
    },
    Stop {
        requester: ObserverId,
    },
    RequestPairing {
        requester: ObserverId,
        phone_number: String,
    },
    ObserverJoined {
        observer: ObserverId,
    },
    ConnectFinished {
        attempt: u64,
        result: Result<SessionHandle, ConnectError>,
    },
    Session {
        attempt: u64,
        event: SessionEvent,
    },
    PairingFinished {
        attempt: u64,
        requester: ObserverId,
        result: Result<String, PairingError>,
    },
    RetryElapsed {
        attempt: u64,
    },
    CloseFinished {
        attempt: u64,
    },
}

/// Cloneable entry point into the manager task
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<SessionState>,
}

impl ManagerHandle {
    /// Request a session start; `None` for starts not tied to an observer
    pub fn start(&self, requester: Option<ObserverId>) {
        self.submit(Input::Start { requester });
    }

    pub fn stop(&self, requester: ObserverId) {
        self.submit(Input::Stop { requester });
    }

    pub fn request_pairing(&self, requester: ObserverId, phone_number: String) {
        self.submit(Input::RequestPairing {
            requester,
            phone_number,
        });
    }

    /// Replay current state to a freshly connected observer
    pub fn observer_joined(&self, observer: ObserverId) {
        self.submit(Input::ObserverJoined { observer });
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn submit(&self, input: Input) {
        if self.tx.send(input).is_err() {
            error!("Connection manager is not running");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CloseCause {
    code: Option<u16>,
    logged_out: bool,
}

/// Owner of the session state machine
pub struct ConnectionManager {
    state: SessionState,
    attempt: u64,
    session: Arc<SessionConnection>,
    fanout: Fanout,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox: mpsc::UnboundedReceiver<Input>,
    state_tx: watch::Sender<SessionState>,
    retry_delay: Duration,
    retry_timer: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    qr: Option<String>,
    pairing_code: Option<String>,
    pending_pairing: Vec<(ObserverId, String)>,
    last_close: Option<CloseCause>,
}

impl ConnectionManager {
    /// Spawn the manager task
    pub fn spawn(
        session: Arc<SessionConnection>,
        fanout: Fanout,
        inbound: mpsc::UnboundedSender<InboundMessage>,
        retry_delay: Duration,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let manager = Self {
            state: SessionState::Idle,
            attempt: 0,
            session,
            fanout,
            inbound,
            inbox_tx: inbox_tx.clone(),
            inbox,
            state_tx,
            retry_delay,
            retry_timer: None,
            forwarder: None,
            qr: None,
            pairing_code: None,
            pending_pairing: Vec::new(),
            last_close: None,
        };

        let task = tokio::spawn(manager.run());
        let handle = ManagerHandle {
            tx: inbox_tx,
            state: state_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        while let Some(input) = self.inbox.recv().await {
            self.handle(input);
        }
        self.cancel_retry();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Start { requester } => self.apply(Trigger::StartRequested, requester),
            Input::Stop { requester } => self.apply(Trigger::StopRequested, Some(requester)),
            Input::ObserverJoined { observer } => self.replay(observer),
            Input::RequestPairing {
                requester,
                phone_number,
            } => self.on_pairing_request(requester, phone_number),
            Input::ConnectFinished { attempt, result } => self.on_connect_finished(attempt, result),
            Input::Session { attempt, event } => {
                if attempt != self.attempt {
                    debug!("Ignoring event from superseded attempt {}: {:?}", attempt, event);
                    return;
                }
                self.on_session_event(event);
            }
            Input::PairingFinished {
                attempt,
                requester,
                result,
            } => match result {
                Ok(code) if attempt == self.attempt => {
                    info!("🔑 Pairing code issued");
                    self.on_session_event(SessionEvent::PairingCodeReceived(code));
                }
                Ok(_) => debug!("Dropping pairing code from superseded attempt {}", attempt),
                Err(e) => {
                    warn!("Pairing code request failed: {}", e);
                    self.fanout.send_to(
                        &requester,
                        ServerEvent::error(format!("Failed to generate pairing code: {}", e)),
                    );
                }
            },
            Input::RetryElapsed { attempt } => {
                if attempt != self.attempt {
                    return;
                }
                self.retry_timer = None;
                self.apply(Trigger::RetryElapsed, None);
            }
            Input::CloseFinished { attempt } => {
                if attempt == self.attempt {
                    self.apply(Trigger::CloseCompleted, None);
                }
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::QrReceived(qr) => {
                self.qr = Some(qr);
                self.apply(Trigger::QrReceived, None);
            }
            SessionEvent::PairingCodeReceived(code) => {
                self.pairing_code = Some(code);
                self.apply(Trigger::PairingCodeReceived, None);
            }
            SessionEvent::ConnectionOpened => {
                self.last_close = None;
                self.apply(Trigger::ConnectionOpened, None);
            }
            SessionEvent::ConnectionClosed {
                cause_code,
                is_logout,
            } => {
                if is_logout {
                    warn!(
                        "Session logged out (code {:?}); delete the session directory and start again",
                        cause_code
                    );
                } else {
                    info!("Session closed (code {:?})", cause_code);
                }
                self.last_close = Some(CloseCause {
                    code: cause_code,
                    logged_out: is_logout,
                });
                self.apply(Trigger::ConnectionClosed { is_logout }, None);
            }
            SessionEvent::InboundMessage(message) => {
                if self.inbound.send(message).is_err() {
                    warn!("Inbound message dropped, dispatcher is gone");
                }
            }
        }
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<SessionHandle, ConnectError>) {
        if attempt != self.attempt || self.state != SessionState::Starting {
            if let Ok(handle) = result {
                debug!("Closing session from superseded attempt {}", attempt);
                tokio::spawn(async move { handle.client.close().await });
            }
            return;
        }

        match result {
            Ok(SessionHandle { client, mut events }) => {
                self.session.install(client);

                let inbox = self.inbox_tx.clone();
                self.forwarder = Some(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if inbox.send(Input::Session { attempt, event }).is_err() {
                            break;
                        }
                    }
                }));

                for (requester, phone_number) in std::mem::take(&mut self.pending_pairing) {
                    self.spawn_pairing(requester, phone_number);
                }
            }
            Err(ConnectError::Credentials(e)) => {
                error!("Failed to load credentials: {}", e);
                self.fanout
                    .broadcast(ServerEvent::error(format!("Failed to start session: {}", e)));
                self.apply(Trigger::CredentialsUnavailable, None);
            }
            Err(ConnectError::Transport(reason)) => {
                warn!("Protocol session unreachable: {}", reason);
                self.apply(Trigger::TransportUnavailable, None);
            }
        }
    }

    fn on_pairing_request(&mut self, requester: ObserverId, phone_number: String) {
        if self.state == SessionState::Open {
            self.fanout
                .send_to(&requester, ServerEvent::error("Session is already connected"));
            return;
        }

        if self.state.is_authenticating() && self.session.is_live() {
            self.spawn_pairing(requester, phone_number);
            return;
        }

        // No live handle yet: queue until the connect completes
        debug!("Queueing pairing request until the session is live");
        self.pending_pairing.push((requester, phone_number));
        self.apply(Trigger::StartRequested, None);
    }

    fn spawn_pairing(&self, requester: ObserverId, phone_number: String) {
        let session = self.session.clone();
        let inbox = self.inbox_tx.clone();
        let attempt = self.attempt;

        tokio::spawn(async move {
            let result = session.request_pairing_code(&phone_number).await;
            let _ = inbox.send(Input::PairingFinished {
                attempt,
                requester,
                result,
            });
        });
    }

    fn apply(&mut self, trigger: Trigger, requester: Option<ObserverId>) {
        let from = self.state;
        let transition = from.on(trigger);

        self.state = transition.next;
        self.state_tx.send_replace(self.state);

        if transition.changed(from) {
            info!("📶 Session state {:?} -> {:?} ({:?})", from, self.state, trigger);
            self.fanout.broadcast(self.state_event());
        }

        for effect in transition.effects {
            self.run_effect(effect, requester);
        }
    }

    fn run_effect(&mut self, effect: Effect, requester: Option<ObserverId>) {
        match effect {
            Effect::BeginConnect => self.begin_connect(),
            Effect::ScheduleRetry => self.schedule_retry(),
            Effect::CancelRetry => self.cancel_retry(),
            Effect::CloseSession => self.close_session(),
            Effect::DropSession => self.drop_session(),
            Effect::ClearAuthPrompt => {
                self.qr = None;
                self.pairing_code = None;
            }
            Effect::BroadcastQr => {
                if let Some(data) = self.qr.clone() {
                    self.fanout.broadcast(ServerEvent::Qr { data });
                }
            }
            Effect::BroadcastPairingCode => {
                if let Some(code) = self.pairing_code.clone() {
                    self.fanout.broadcast(ServerEvent::PairingCode { code });
                }
            }
            Effect::ReplayToRequester => {
                if let Some(observer) = requester {
                    self.replay(observer);
                }
            }
        }
    }

    fn begin_connect(&mut self) {
        self.attempt += 1;
        self.last_close = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        let attempt = self.attempt;
        let session = self.session.clone();
        let inbox = self.inbox_tx.clone();
        info!("🚀 Starting session attempt {}", attempt);

        tokio::spawn(async move {
            let result = session.connect().await;
            let _ = inbox.send(Input::ConnectFinished { attempt, result });
        });
    }

    fn schedule_retry(&mut self) {
        self.cancel_retry();

        let attempt = self.attempt;
        let delay = self.retry_delay;
        let inbox = self.inbox_tx.clone();
        info!("🔁 Reconnecting in {:?}", delay);

        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Input::RetryElapsed { attempt });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            debug!("Cancelling pending reconnect");
            timer.abort();
        }
    }

    fn close_session(&mut self) {
        // Invalidate the closing attempt so its trailing events are ignored
        self.attempt += 1;
        let attempt = self.attempt;
        let inbox = self.inbox_tx.clone();
        let client = self.session.live();
        info!("🛑 Closing session");

        tokio::spawn(async move {
            if let Some(client) = client {
                client.close().await;
            }
            let _ = inbox.send(Input::CloseFinished { attempt });
        });
    }

    fn drop_session(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.session.clear();

        for (requester, _) in std::mem::take(&mut self.pending_pairing) {
            self.fanout.send_to(
                &requester,
                ServerEvent::error(format!(
                    "Failed to generate pairing code: {}",
                    PairingError::Aborted
                )),
            );
        }
    }

    fn state_event(&self) -> ServerEvent {
        let cause = match self.state {
            SessionState::Idle | SessionState::Reconnecting => self.last_close,
            _ => None,
        };
        ServerEvent::ConnectionState {
            status: self.state,
            cause_code: cause.and_then(|c| c.code),
            logged_out: cause.is_some_and(|c| c.logged_out),
        }
    }

    /// Current state plus any pending auth prompt, to one observer
    fn replay(&self, observer: ObserverId) {
        self.fanout.send_to(&observer, self.state_event());
        match self.state {
            SessionState::AwaitingQr => {
                if let Some(data) = self.qr.clone() {
                    self.fanout.send_to(&observer, ServerEvent::Qr { data });
                }
            }
            SessionState::AwaitingPairing => {
                if let Some(code) = self.pairing_code.clone() {
                    self.fanout.send_to(&observer, ServerEvent::PairingCode { code });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::payload::OutboundPayload;
    use crate::session::{
        CredentialBlob, CredentialStore, ProtocolClient, ProtocolConnector, RawConnection,
        RawProtocolEvent,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    const DELAY: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct ScriptedConnector {
        connects: AtomicUsize,
        events: Mutex<Option<mpsc::UnboundedSender<RawProtocolEvent>>>,
    }

    impl ScriptedConnector {
        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn update(&self, connection: RawConnection, status_code: Option<u16>) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(RawProtocolEvent::ConnectionUpdate {
                    connection: Some(connection),
                    qr: None,
                    status_code,
                });
            }
        }
    }

    struct QuietClient;

    #[async_trait]
    impl ProtocolClient for QuietClient {
        async fn send_message(&self, _: &str, _: &OutboundPayload) -> Result<(), SendError> {
            Ok(())
        }

        async fn request_pairing_code(&self, _: &str) -> Result<String, PairingError> {
            Ok("WXYZ-0000".to_string())
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl ProtocolConnector for ScriptedConnector {
        async fn connect(
            &self,
            _credentials: Option<CredentialBlob>,
            events: mpsc::UnboundedSender<RawProtocolEvent>,
        ) -> Result<Arc<dyn ProtocolClient>, ConnectError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.events.lock() = Some(events);
            Ok(Arc::new(QuietClient))
        }
    }

    struct Harness {
        handle: ManagerHandle,
        session: Arc<SessionConnection>,
        connector: Arc<ScriptedConnector>,
        events: mpsc::Receiver<ServerEvent>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(ScriptedConnector::default());
        let session = Arc::new(SessionConnection::new(
            connector.clone(),
            CredentialStore::new(dir.path()),
        ));
        let fanout = Fanout::new();
        let (tx, events) = mpsc::channel(64);
        fanout.register(Uuid::new_v4(), tx);
        let (inbound, _) = mpsc::unbounded_channel();
        let (handle, _task) = ConnectionManager::spawn(session.clone(), fanout, inbound, DELAY);

        Harness {
            handle,
            session,
            connector,
            events,
            _dir: dir,
        }
    }

    impl Harness {
        async fn until_state(&self, state: SessionState) {
            let mut rx = self.handle.subscribe_state();
            rx.wait_for(|s| *s == state).await.unwrap();
        }

        async fn until_live(&self) {
            while !self.session.is_live() {
                tokio::task::yield_now().await;
            }
        }

        async fn open(&self) {
            self.handle.start(None);
            self.until_live().await;
            self.connector.update(RawConnection::Open, None);
            self.until_state(SessionState::Open).await;
        }

        fn states(&mut self) -> Vec<ServerEvent> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if matches!(event, ServerEvent::ConnectionState { .. }) {
                    states.push(event);
                }
            }
            states
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fires_after_fixed_delay() {
        let mut h = harness();
        h.open().await;

        h.connector.update(RawConnection::Close, Some(408));
        h.until_state(SessionState::Reconnecting).await;
        assert!(!h.session.is_live());

        tokio::time::sleep(DELAY - Duration::from_secs(1)).await;
        assert_eq!(h.handle.state(), SessionState::Reconnecting);
        assert_eq!(h.connector.connects(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.handle.state(), SessionState::Starting);

        let states = h.states();
        assert!(states.contains(&ServerEvent::ConnectionState {
            status: SessionState::Reconnecting,
            cause_code: Some(408),
            logged_out: false,
        }));
        assert_eq!(states.last(), Some(&ServerEvent::state(SessionState::Starting)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_never_retries() {
        let h = harness();
        h.open().await;

        h.connector
            .update(RawConnection::Close, Some(crate::session::LOGGED_OUT_STATUS));
        h.until_state(SessionState::Idle).await;

        tokio::time::sleep(DELAY * 10).await;
        assert_eq!(h.handle.state(), SessionState::Idle);
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_reconnecting_cancels_timer() {
        let h = harness();
        h.open().await;

        h.connector.update(RawConnection::Close, None);
        h.until_state(SessionState::Reconnecting).await;
        h.handle.stop(Uuid::new_v4());
        h.until_state(SessionState::Idle).await;

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(h.handle.state(), SessionState::Idle);
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_reconnecting_connects_now() {
        let h = harness();
        h.open().await;

        h.connector.update(RawConnection::Close, Some(503));
        h.until_state(SessionState::Reconnecting).await;

        h.handle.start(None);
        h.until_state(SessionState::Starting).await;
        while h.connector.connects() < 2 {
            tokio::task::yield_now().await;
        }

        // The cancelled timer must not produce a third attempt
        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_stop_are_ignored() {
        let h = harness();
        h.open().await;

        h.handle.stop(Uuid::new_v4());
        h.until_state(SessionState::Idle).await;

        // Trailing events from the closed session
        h.connector.update(RawConnection::Open, None);
        h.connector.update(RawConnection::Close, Some(500));
        tokio::time::sleep(DELAY * 2).await;

        assert_eq!(h.handle.state(), SessionState::Idle);
        assert_eq!(h.connector.connects(), 1);
    }
}
