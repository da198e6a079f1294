//! Observer command dispatch and inbound message handling

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auto_reply::{AutoReplyEngine, AutoReplyMatch};
use crate::error::PayloadError;
use crate::fanout::Fanout;
use crate::history::HistoryLog;
use crate::manager::ManagerHandle;
use crate::payload::{self, OutboundPayload};
use crate::session::SessionConnection;
use crate::types::{
    ButtonSpec, ClientCommand, HistoryEntry, HistoryStatus, InboundMessage, MediaInput,
    ObserverId, SentKind, ServerEvent,
};

/// Routes each observer command to the component that owns it
#[derive(Clone)]
pub struct Dispatcher {
    manager: ManagerHandle,
    session: Arc<SessionConnection>,
    history: Arc<HistoryLog>,
    auto_replies: Arc<AutoReplyEngine>,
    fanout: Fanout,
    max_media_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        manager: ManagerHandle,
        session: Arc<SessionConnection>,
        history: Arc<HistoryLog>,
        auto_replies: Arc<AutoReplyEngine>,
        fanout: Fanout,
        max_media_bytes: usize,
    ) -> Self {
        Self {
            manager,
            session,
            history,
            auto_replies,
            fanout,
            max_media_bytes,
        }
    }

    /// Register an observer: history snapshot first, then current connection state
    pub fn join(&self, observer: ObserverId, tx: mpsc::Sender<ServerEvent>) {
        self.history.attach(observer, tx);
        self.manager.observer_joined(observer);
    }

    pub fn leave(&self, observer: &ObserverId) {
        self.fanout.unregister(observer);
    }

    /// Send an event to one observer
    pub fn reply(&self, observer: &ObserverId, event: ServerEvent) {
        self.fanout.send_to(observer, event);
    }

    pub async fn handle_command(&self, observer: ObserverId, command: ClientCommand) {
        match command {
            ClientCommand::StartSession => self.manager.start(Some(observer)),
            ClientCommand::StopSession => self.manager.stop(observer),
            ClientCommand::RequestPairing { phone_number } => {
                let phone_number = phone_number.trim().to_string();
                if phone_number.is_empty() {
                    self.reply(&observer, ServerEvent::error("Phone number must not be empty"));
                    return;
                }
                self.manager.request_pairing(observer, phone_number);
            }
            ClientCommand::SendText { to, text } => {
                self.send_single(observer, &to, Ok(OutboundPayload::Text(text)), SentKind::SingleText)
                    .await;
            }
            ClientCommand::SendMedia {
                to,
                media_bytes,
                mime_type,
                caption,
                file_name,
            } => {
                let input = MediaInput {
                    media_bytes,
                    mime_type,
                    caption,
                    file_name,
                };
                let payload =
                    payload::decode_media(&input, self.max_media_bytes).map(OutboundPayload::Media);
                self.send_single(observer, &to, payload, SentKind::SingleMedia)
                    .await;
            }
            ClientCommand::SendButtons {
                to,
                text,
                buttons,
                media,
            } => {
                let payload =
                    payload::button_payload(text, &buttons, media.as_ref(), self.max_media_bytes);
                self.send_single(observer, &to, payload, SentKind::SingleButtons)
                    .await;
            }
            ClientCommand::SendBroadcast {
                to,
                text,
                media,
                buttons,
            } => {
                self.send_broadcast(observer, &to, text, media.as_ref(), &buttons)
                    .await;
            }
            ClientCommand::SetAutoReply { keyword, reply } => {
                match self.auto_replies.add_rule(keyword, reply) {
                    Ok(()) => self.reply(&observer, ServerEvent::sent_ok(SentKind::AutoReply)),
                    Err(e) => self.reject(&observer, e),
                }
            }
            ClientCommand::ListAutoReplies => {
                let rules = self.auto_replies.rules();
                self.reply(&observer, ServerEvent::AutoReplies { rules });
            }
            ClientCommand::Ping => self.reply(&observer, ServerEvent::Pong),
        }
    }

    fn reject(&self, observer: &ObserverId, error: PayloadError) {
        debug!("Rejected payload from observer {}: {}", observer, error);
        self.reply(observer, ServerEvent::error(format!("Invalid payload: {}", error)));
    }

    async fn send_single(
        &self,
        observer: ObserverId,
        to: &str,
        payload: Result<OutboundPayload, PayloadError>,
        kind: SentKind,
    ) {
        let prepared = payload::normalize_jid(to).and_then(|jid| payload.map(|p| (jid, p)));
        let (jid, payload) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reject(&observer, e);
                return;
            }
        };

        match self.session.send(&jid, &payload).await {
            Ok(()) => {
                info!("📨 Sent {:?} to {}", kind, jid);
                self.history.append(HistoryEntry::new(
                    to.trim(),
                    payload.history_text(),
                    sent_status(&payload),
                ));
                self.reply(&observer, ServerEvent::sent_ok(kind));
            }
            Err(e) => {
                warn!("Failed to send {:?} to {}: {}", kind, jid, e);
                self.reply(&observer, ServerEvent::error(format!("Failed to send message: {}", e)));
            }
        }
    }

    /// Send the same content to each recipient in turn. One failure never
    /// aborts the rest; every recipient gets a history entry and the requester
    /// gets a single aggregated acknowledgement.
    async fn send_broadcast(
        &self,
        observer: ObserverId,
        recipients: &[String],
        text: Option<String>,
        media: Option<&MediaInput>,
        buttons: &[ButtonSpec],
    ) {
        if recipients.is_empty() {
            self.reject(&observer, PayloadError::NoRecipients);
            return;
        }

        let payload =
            match payload::broadcast_payload(text, media, buttons, self.max_media_bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    self.reject(&observer, e);
                    return;
                }
            };

        if !self.session.is_live() {
            self.reply(&observer, ServerEvent::error("Broadcast failed: session is not connected"));
            return;
        }

        let history_text = payload.history_text();
        let mut delivered = 0;
        let mut failed = 0;

        for recipient in recipients {
            let outcome = match payload::normalize_jid(recipient) {
                Ok(jid) => self
                    .session
                    .send(&jid, &payload)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            let status = match outcome {
                Ok(()) => {
                    delivered += 1;
                    sent_status(&payload)
                }
                Err(reason) => {
                    warn!("Broadcast to {:?} failed: {}", recipient, reason);
                    failed += 1;
                    HistoryStatus::Failed
                }
            };
            self.history
                .append(HistoryEntry::new(recipient.trim(), history_text.clone(), status));
        }

        info!(
            "📢 Broadcast finished: {} delivered, {} failed",
            delivered, failed
        );
        self.reply(
            &observer,
            ServerEvent::SentOk {
                kind: SentKind::Broadcast,
                delivered: Some(delivered),
                failed: Some(failed),
            },
        );
    }

    /// Consume inbound messages until the manager goes away
    pub async fn run_inbound(self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_inbound(message);
        }
        debug!("Inbound message loop stopped");
    }

    /// Show the message to observers, then fire every matching auto-reply.
    ///
    /// Replies run on their own task so a slow send never holds back the
    /// next inbound message.
    pub fn handle_inbound(&self, message: InboundMessage) {
        debug!("Inbound message from {}", message.from);
        let matches = self.auto_replies.evaluate(&message.text);
        let from = message.from.clone();
        self.fanout.broadcast(ServerEvent::InboundMessage(message));

        if matches.is_empty() {
            return;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.send_auto_replies(from, matches).await });
    }

    /// Send each matched reply in rule order and log the outcome
    async fn send_auto_replies(&self, to: String, matches: Vec<AutoReplyMatch>) {
        for matched in matches {
            let reply = OutboundPayload::Text(matched.reply.clone());
            let status = match self.session.send(&to, &reply).await {
                Ok(()) => {
                    info!(
                        "🤖 Auto-reply rule #{} ({:?}) answered {}",
                        matched.rule_index, matched.keyword, to
                    );
                    HistoryStatus::AutoReply
                }
                Err(e) => {
                    warn!("Auto-reply to {} failed: {}", to, e);
                    HistoryStatus::Failed
                }
            };
            self.history
                .append(HistoryEntry::new(to.clone(), matched.reply, status));
        }
    }
}

fn sent_status(payload: &OutboundPayload) -> HistoryStatus {
    match payload {
        OutboundPayload::Buttons { .. } => HistoryStatus::SentButton,
        _ => HistoryStatus::Sent,
    }
}
