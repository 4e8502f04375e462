use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use tokio::sync::mpsc;

use duel_core::protocol::{PlayerId, ServerMessage};

use crate::coordinator::MatchCoordinator;

/// Handle to push messages to a connected WebSocket client.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub player_id: PlayerId,
    pub username: String,
    /// Distinguishes a reconnect from the socket it replaced.
    pub conn_id: u64,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Shared application state.
pub struct AppState {
    pub coordinator: Arc<MatchCoordinator>,
    pub connection_count: AtomicU32,
    pub max_connections: u32,
    /// Unknown players are created on connect instead of rejected.
    pub dev_mode: bool,
}
