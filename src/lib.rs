//! WA Session Hub Library
//!
//! Orchestrates one messaging-protocol session on behalf of any number of
//! dashboard observers.
//!
//! # Architecture
//!
//! ```text
//! Dashboards ──WebSocket──▶ Hub (this) ──WebSocket──▶ Protocol sidecar
//!                            │
//!                            ├── Observer server (/ws, /health)
//!                            ├── Connection manager (state machine, retries)
//!                            ├── Auto-reply engine
//!                            └── History log (bounded, in-memory)
//! ```
//!
//! # Usage
//!
//! ## Running the hub
//!
//! ```bash
//! export BRIDGE_URL=ws://127.0.0.1:8765   # protocol sidecar
//! export SESSION_DIR=./session            # credential material
//! export PORT=3000
//!
//! wa-session-hub
//! ```
//!
//! ## Talking to the hub
//!
//! Observers connect to `/ws` and exchange JSON frames:
//!
//! ```json
//! // 1. Start (or re-report) the session
//! {"type": "start-session"}
//!
//! // 2. Receive the login prompt and state changes
//! {"type": "qr", "data": "2@..."}
//! {"type": "connection-state", "status": "open", "loggedOut": false}
//!
//! // 3. Send messages
//! {"type": "send-text", "to": "628123456789", "text": "Halo"}
//! ```

pub mod auto_reply;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod history;
pub mod hub;
pub mod manager;
pub mod payload;
pub mod server;
pub mod session;
pub mod state;
pub mod types;

pub use auto_reply::AutoReplyEngine;
pub use config::HubConfig;
pub use dispatcher::Dispatcher;
pub use fanout::Fanout;
pub use history::HistoryLog;
pub use hub::Hub;
pub use manager::{ConnectionManager, ManagerHandle};
pub use session::SessionConnection;
pub use state::SessionState;
pub use types::*;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::error::{ConnectError, PairingError, PayloadError, SendError};
    pub use crate::hub::Hub;
    pub use crate::session::{ProtocolClient, ProtocolConnector, RawProtocolEvent};
    pub use crate::state::SessionState;
    pub use crate::types::*;
}
