//! Session state machine
//!
//! The transition function is pure: it maps the current [`SessionState`] and a
//! [`Trigger`] to the next state plus the effects the manager must carry out.
//! Only [`crate::manager`] applies transitions.

use serde::{Deserialize, Serialize};

/// Lifecycle of the single protocol session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    AwaitingQr,
    AwaitingPairing,
    Open,
    Closing,
    Reconnecting,
    Failed,
}

impl SessionState {
    /// An attempt is in flight or established; a new `connect()` must not start
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::AwaitingQr | Self::AwaitingPairing | Self::Open
        )
    }

    /// Authentication handshake is underway
    pub fn is_authenticating(self) -> bool {
        matches!(self, Self::Starting | Self::AwaitingQr | Self::AwaitingPairing)
    }
}

/// Inputs that can move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartRequested,
    StopRequested,
    QrReceived,
    PairingCodeReceived,
    ConnectionOpened,
    ConnectionClosed { is_logout: bool },
    /// Credential material could not be loaded
    CredentialsUnavailable,
    /// Protocol session unreachable during connect
    TransportUnavailable,
    RetryElapsed,
    CloseCompleted,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Spawn a new `connect()` attempt
    BeginConnect,
    /// Arm the fixed-delay retry timer (replacing any pending one)
    ScheduleRetry,
    CancelRetry,
    /// Ask the live session to close
    CloseSession,
    /// Forget the live handle of the current attempt
    DropSession,
    /// Forget cached QR / pairing code
    ClearAuthPrompt,
    BroadcastQr,
    BroadcastPairingCode,
    /// Re-send the current state to the requesting observer only
    ReplayToRequester,
}

/// Result of applying a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }

    fn stay(state: SessionState) -> Self {
        Self::to(state, &[])
    }

    pub fn changed(&self, from: SessionState) -> bool {
        self.next != from
    }
}

impl SessionState {
    /// Apply a trigger; unknown combinations leave the state untouched
    pub fn on(self, trigger: Trigger) -> Transition {
        use Effect::*;
        use SessionState::*;

        match (self, trigger) {
            (Idle | Failed, Trigger::StartRequested) => Transition::to(Starting, &[BeginConnect]),
            (Reconnecting, Trigger::StartRequested) => {
                Transition::to(Starting, &[CancelRetry, BeginConnect])
            }
            (_, Trigger::StartRequested) => Transition::to(self, &[ReplayToRequester]),

            (Starting | AwaitingQr, Trigger::QrReceived) => Transition::to(AwaitingQr, &[BroadcastQr]),

            (Starting | AwaitingQr | AwaitingPairing, Trigger::PairingCodeReceived) => {
                Transition::to(AwaitingPairing, &[BroadcastPairingCode])
            }

            (Starting | AwaitingQr | AwaitingPairing, Trigger::ConnectionOpened) => {
                Transition::to(Open, &[CancelRetry, ClearAuthPrompt])
            }

            (Closing, Trigger::ConnectionClosed { .. } | Trigger::CloseCompleted) => {
                Transition::to(Idle, &[DropSession, ClearAuthPrompt])
            }
            (Starting | AwaitingQr | AwaitingPairing | Open, Trigger::ConnectionClosed { is_logout }) => {
                if is_logout {
                    Transition::to(Idle, &[DropSession, ClearAuthPrompt])
                } else {
                    Transition::to(Reconnecting, &[DropSession, ClearAuthPrompt, ScheduleRetry])
                }
            }

            (Starting, Trigger::CredentialsUnavailable) => {
                Transition::to(Failed, &[DropSession, ClearAuthPrompt])
            }
            (Starting, Trigger::TransportUnavailable) => {
                Transition::to(Reconnecting, &[DropSession, ScheduleRetry])
            }

            (Reconnecting, Trigger::RetryElapsed) => Transition::to(Starting, &[BeginConnect]),

            (Starting | AwaitingQr | AwaitingPairing | Open, Trigger::StopRequested) => {
                Transition::to(Closing, &[CancelRetry, CloseSession])
            }
            (Reconnecting, Trigger::StopRequested) => Transition::to(Idle, &[CancelRetry]),
            (_, Trigger::StopRequested) => Transition::to(self, &[ReplayToRequester]),

            _ => Transition::stay(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 8] = [
        SessionState::Idle,
        SessionState::Starting,
        SessionState::AwaitingQr,
        SessionState::AwaitingPairing,
        SessionState::Open,
        SessionState::Closing,
        SessionState::Reconnecting,
        SessionState::Failed,
    ];

    fn connects(t: &Transition) -> usize {
        t.effects
            .iter()
            .filter(|e| **e == Effect::BeginConnect)
            .count()
    }

    #[test]
    fn test_start_from_idle() {
        let t = SessionState::Idle.on(Trigger::StartRequested);
        assert_eq!(t.next, SessionState::Starting);
        assert_eq!(t.effects, vec![Effect::BeginConnect]);
    }

    #[test]
    fn test_start_is_idempotent_while_active() {
        for state in ALL.into_iter().filter(|s| s.is_active()) {
            let t = state.on(Trigger::StartRequested);
            assert_eq!(t.next, state);
            assert_eq!(connects(&t), 0, "{:?} must not reconnect", state);
            assert_eq!(t.effects, vec![Effect::ReplayToRequester]);
        }
    }

    #[test]
    fn test_start_during_reconnect_cancels_timer() {
        let t = SessionState::Reconnecting.on(Trigger::StartRequested);
        assert_eq!(t.next, SessionState::Starting);
        assert_eq!(t.effects, vec![Effect::CancelRetry, Effect::BeginConnect]);
    }

    #[test]
    fn test_qr_then_open() {
        let t = SessionState::Starting.on(Trigger::QrReceived);
        assert_eq!(t.next, SessionState::AwaitingQr);
        assert!(t.effects.contains(&Effect::BroadcastQr));

        // QR refresh keeps broadcasting
        let t = SessionState::AwaitingQr.on(Trigger::QrReceived);
        assert_eq!(t.next, SessionState::AwaitingQr);
        assert!(t.effects.contains(&Effect::BroadcastQr));

        let t = SessionState::AwaitingQr.on(Trigger::ConnectionOpened);
        assert_eq!(t.next, SessionState::Open);
        assert!(t.effects.contains(&Effect::CancelRetry));
        assert!(t.effects.contains(&Effect::ClearAuthPrompt));
    }

    #[test]
    fn test_pairing_code_path() {
        for state in [
            SessionState::Starting,
            SessionState::AwaitingQr,
            SessionState::AwaitingPairing,
        ] {
            let t = state.on(Trigger::PairingCodeReceived);
            assert_eq!(t.next, SessionState::AwaitingPairing);
            assert_eq!(t.effects, vec![Effect::BroadcastPairingCode]);
        }

        // QR noise while pairing does not pull the state back
        let t = SessionState::AwaitingPairing.on(Trigger::QrReceived);
        assert_eq!(t.next, SessionState::AwaitingPairing);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_logout_close_goes_idle_without_retry() {
        for state in ALL.into_iter().filter(|s| s.is_active()) {
            let t = state.on(Trigger::ConnectionClosed { is_logout: true });
            assert_eq!(t.next, SessionState::Idle);
            assert!(!t.effects.contains(&Effect::ScheduleRetry));
        }
    }

    #[test]
    fn test_transient_close_schedules_one_retry() {
        for state in ALL.into_iter().filter(|s| s.is_active()) {
            let t = state.on(Trigger::ConnectionClosed { is_logout: false });
            assert_eq!(t.next, SessionState::Reconnecting);
            let retries = t
                .effects
                .iter()
                .filter(|e| **e == Effect::ScheduleRetry)
                .count();
            assert_eq!(retries, 1);
        }
    }

    #[test]
    fn test_retry_elapsed_restarts() {
        let t = SessionState::Reconnecting.on(Trigger::RetryElapsed);
        assert_eq!(t.next, SessionState::Starting);
        assert_eq!(connects(&t), 1);

        // A late timer in any other state is ignored
        for state in ALL.into_iter().filter(|s| *s != SessionState::Reconnecting) {
            assert_eq!(state.on(Trigger::RetryElapsed), Transition::stay(state));
        }
    }

    #[test]
    fn test_credential_failure_is_terminal_until_restart() {
        let t = SessionState::Starting.on(Trigger::CredentialsUnavailable);
        assert_eq!(t.next, SessionState::Failed);
        assert!(!t.effects.contains(&Effect::ScheduleRetry));

        let t = SessionState::Failed.on(Trigger::StartRequested);
        assert_eq!(t.next, SessionState::Starting);
    }

    #[test]
    fn test_transport_failure_retries() {
        let t = SessionState::Starting.on(Trigger::TransportUnavailable);
        assert_eq!(t.next, SessionState::Reconnecting);
        assert!(t.effects.contains(&Effect::ScheduleRetry));
    }

    #[test]
    fn test_stop_paths() {
        let t = SessionState::Open.on(Trigger::StopRequested);
        assert_eq!(t.next, SessionState::Closing);
        assert_eq!(t.effects, vec![Effect::CancelRetry, Effect::CloseSession]);

        let t = SessionState::Closing.on(Trigger::CloseCompleted);
        assert_eq!(t.next, SessionState::Idle);

        // Close reported by the session while closing never retries
        let t = SessionState::Closing.on(Trigger::ConnectionClosed { is_logout: false });
        assert_eq!(t.next, SessionState::Idle);
        assert!(!t.effects.contains(&Effect::ScheduleRetry));

        let t = SessionState::Reconnecting.on(Trigger::StopRequested);
        assert_eq!(t.next, SessionState::Idle);
        assert_eq!(t.effects, vec![Effect::CancelRetry]);
    }

    #[test]
    fn test_stale_close_ignored_when_idle() {
        let t = SessionState::Idle.on(Trigger::ConnectionClosed { is_logout: false });
        assert_eq!(t, Transition::stay(SessionState::Idle));
    }
}
