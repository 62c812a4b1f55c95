use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::constants::CLOSE_GOING_AWAY;
use crate::core::message_handler::Disposition;
use crate::core::server::SharedRelayServer;

// Handle a WebSocket connection
pub async fn handle_ws_client(ws: WebSocket, server: SharedRelayServer) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn a task to forward messages from our channel to the WebSocket
    let writer = tokio::task::spawn(async move {
        let mut rx = rx;
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    if !server.is_accepting() {
        info!("Rejecting connection during shutdown");
        let _ = tx.send(Message::close_with(CLOSE_GOING_AWAY, "Server shutting down"));
        return;
    }

    let mut session = server.open_connection(tx).await;
    let connection = session.connection().clone();

    loop {
        tokio::select! {
            _ = connection.terminated() => {
                info!("Connection {} terminated", connection.id);
                writer.abort();
                break;
            }
            next = ws_rx.next() => match next {
                Some(Ok(msg)) => {
                    if msg.is_pong() {
                        connection.liveness().mark_alive();
                    } else if msg.is_close() {
                        debug!("Client {} sent close frame", connection.id);
                        break;
                    } else if let Ok(text) = msg.to_str() {
                        let disposition = server.handle_text(&mut session, text).await;
                        if let Disposition::Close { code, reason } = disposition {
                            info!("Closing connection {}: {}", connection.id, reason);
                            connection.close(code, reason);
                            break;
                        }
                    }
                    // Binary frames are ignored; pings are answered by the transport
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for client {}: {}", connection.id, e);
                    break;
                }
                None => break,
            }
        }
    }

    // The writer drains queued frames and exits once the last sender is dropped
    server.release(&connection.id).await;
    info!(
        "Client disconnected: {} ({} clients remaining)",
        connection.id,
        server.registry().client_count().await
    );
}
