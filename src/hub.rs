//! Component wiring

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auto_reply::AutoReplyEngine;
use crate::config::HubConfig;
use crate::dispatcher::Dispatcher;
use crate::fanout::Fanout;
use crate::history::HistoryLog;
use crate::manager::{ConnectionManager, ManagerHandle};
use crate::server::ServerState;
use crate::session::{CredentialStore, ProtocolConnector, SessionConnection};

/// Fully wired session hub
pub struct Hub {
    pub manager: ManagerHandle,
    pub dispatcher: Dispatcher,
    pub session: Arc<SessionConnection>,
    pub history: Arc<HistoryLog>,
    pub auto_replies: Arc<AutoReplyEngine>,
    pub fanout: Fanout,
    tasks: Vec<JoinHandle<()>>,
}

impl Hub {
    /// Build every component and spawn the manager and inbound loops
    pub fn start(config: &HubConfig, connector: Arc<dyn ProtocolConnector>) -> Self {
        Self::start_with_retry_delay(config, connector, config.reconnect_delay())
    }

    /// Same as [`Hub::start`] with an explicit reconnect delay
    pub fn start_with_retry_delay(
        config: &HubConfig,
        connector: Arc<dyn ProtocolConnector>,
        retry_delay: Duration,
    ) -> Self {
        let fanout = Fanout::new();
        let history = Arc::new(HistoryLog::new(config.history_capacity, fanout.clone()));
        let auto_replies = Arc::new(AutoReplyEngine::new());
        let session = Arc::new(SessionConnection::new(
            connector,
            CredentialStore::new(&config.session_dir),
        ));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (manager, manager_task) = ConnectionManager::spawn(
            session.clone(),
            fanout.clone(),
            inbound_tx,
            retry_delay,
        );

        let dispatcher = Dispatcher::new(
            manager.clone(),
            session.clone(),
            history.clone(),
            auto_replies.clone(),
            fanout.clone(),
            config.max_media_bytes,
        );
        let inbound_task = tokio::spawn(dispatcher.clone().run_inbound(inbound_rx));

        Self {
            manager,
            dispatcher,
            session,
            history,
            auto_replies,
            fanout,
            tasks: vec![manager_task, inbound_task],
        }
    }

    pub fn server_state(&self, config: &HubConfig) -> ServerState {
        ServerState {
            dispatcher: self.dispatcher.clone(),
            observer_buffer: config.observer_buffer,
            debug_mode: config.debug_mode,
        }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
