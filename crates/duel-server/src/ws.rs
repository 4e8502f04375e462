use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use duel_core::protocol::{ClientMessage, PlayerId, ServerMessage};

use crate::error::DuelError;
use crate::state::AppState;

/// Messages a client may send per window.
const RATE_LIMIT: u32 = 20;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window message counter for one socket.
struct RateLimiter {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) > RATE_WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= RATE_LIMIT
    }
}

/// Top-level WebSocket handler -- spawned per connection.
pub async fn handle_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    player_id: PlayerId,
    username: String,
) {
    state.connection_count.fetch_add(1, Ordering::Relaxed);
    let coordinator = state.coordinator.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = coordinator.attach(player_id, &username, tx.clone());
    info!(player_id, username = %username, "player connected");

    let mut limiter = RateLimiter::new();

    loop {
        tokio::select! {
            // Outbound: forward queued ServerMessage to the WebSocket.
            Some(msg) = rx.recv() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            // Inbound: read from the WebSocket.
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.allow(Instant::now()) {
                            let _ = tx.send(DuelError::RateLimited.to_message());
                            continue;
                        }

                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                debug!(player_id, error = %e, "malformed message");
                                let _ = tx.send(DuelError::Malformed(e.to_string()).to_message());
                                continue;
                            }
                        };

                        coordinator.handle(player_id, client_msg).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    coordinator.detach(player_id, conn_id);
    state.connection_count.fetch_sub(1, Ordering::Relaxed);
    info!(player_id, "player disconnected");
}
