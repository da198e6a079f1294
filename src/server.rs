//! WebSocket server for dashboard observers

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::types::{ClientCommand, ServerEvent};

/// Observer server state
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Dispatcher,
    /// Per-observer outbound queue length
    pub observer_buffer: usize,
    pub debug_mode: bool,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Run the observer server on an already bound listener
pub async fn serve(listener: TcpListener, state: ServerState) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Bind and run the observer server
pub async fn run_server(addr: SocketAddr, state: ServerState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Observer server listening on {}", addr);
    serve(listener, state).await
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handle one observer connection
async fn handle_socket(socket: WebSocket, state: ServerState, addr: SocketAddr) {
    let observer = Uuid::new_v4();
    debug!("New observer {} from {}", observer, addr);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for outgoing events
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.observer_buffer.max(1));

    // Task to send outgoing events
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    state.dispatcher.join(observer, tx);

    // Receive commands from the observer
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if state.debug_mode {
                    debug!("Observer {} frame: {}", observer, text.as_str());
                }
                match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => {
                        // Sends can take a while; keep reading meanwhile
                        let dispatcher = state.dispatcher.clone();
                        tokio::spawn(async move {
                            dispatcher.handle_command(observer, command).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to parse observer command: {}", e);
                        state.dispatcher.reply(
                            &observer,
                            ServerEvent::error(format!("Unrecognized command: {}", e)),
                        );
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!("Observer {} closed connection", observer);
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    state.dispatcher.leave(&observer);
    send_task.abort();
}
