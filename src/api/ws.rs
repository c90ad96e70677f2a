//! Observer WebSocket: snapshot on connect, then live status and log events.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};

use super::AppState;
use crate::manager::WorkerManager;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Observer connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.manager))
}

async fn handle_socket(mut socket: WebSocket, manager: WorkerManager) {
    let mut observer = match manager.connect_observer().await {
        Ok(observer) => observer,
        Err(e) => {
            warn!(error = %e, "Failed to build status snapshot");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            msg = observer.recv() => {
                match msg {
                    Some(msg) => {
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Observer disconnected during send");
                                break;
                            }
                        }
                    }
                    None => {
                        // Dropped by the hub (lagging or shutdown).
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    manager.disconnect_observer(observer.id).await;
    info!(observer_id = %observer.id, "Observer connection closed");
}
