pub mod collab;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod leetcode;
pub mod memory;
pub mod queue;
pub mod routes;
pub mod session;
pub mod state;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::collab::Collaborators;
use crate::config::ServerConfig;
use crate::coordinator::MatchCoordinator;
use crate::queue::{MatchmakingQueue, RatingBand};
use crate::state::AppState;

/// Build a fully configured Router + shared state, and start the background
/// sweep. Must be called inside a tokio runtime.
pub fn build_app(config: &ServerConfig, collab: Collaborators) -> (Router, Arc<AppState>) {
    let queue = match config.rating_band {
        Some(gap) => MatchmakingQueue::new(Box::new(RatingBand::new(gap))),
        None => MatchmakingQueue::open(),
    };
    let coordinator = MatchCoordinator::new(queue, collab, config.timing.clone());
    coordinator.spawn_maintenance(config.sweep_interval);

    let state = Arc::new(AppState {
        coordinator,
        connection_count: AtomicU32::new(0),
        max_connections: config.max_connections,
        dev_mode: config.is_dev_mode(),
    });

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(routes::ws_upgrade))
        .route("/settings/validate", post(routes::validate_settings))
        .route("/matches/{match_id}", get(routes::match_result))
        .route("/rating/preview", get(routes::rating_preview))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    (app, state)
}
