use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use duel_core::filter::{self, Verdict};
use duel_core::protocol::{MatchId, MatchResult, PlayerId};
use duel_core::rating::{self, DEFAULT_RATING, RatingPreview};
use duel_core::{Difficulty, TopicId};

use crate::collab::PlayerSnapshot;
use crate::error::DuelError;
use crate::state::AppState;
use crate::ws;

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> &'static str {
    "ok"
}

// ── Settings validation ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub topics: Vec<TopicId>,
    /// 1 = Easy, 2 = Medium, 3 = Hard.
    #[serde(default)]
    pub difficulty: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockLevel {
    Ok,
    Soft,
    Hard,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsVerdict {
    pub level: BlockLevel,
    pub can_join: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Selected topics that cannot be drawn at the selected difficulties.
    pub disallowed_topics: Vec<TopicId>,
}

impl From<Verdict> for SettingsVerdict {
    fn from(verdict: Verdict) -> Self {
        let message = verdict.message();
        let can_join = verdict.can_join();
        let (level, disallowed_topics) = match verdict {
            Verdict::Ok => (BlockLevel::Ok, Vec::new()),
            Verdict::Soft {
                disallowed_topics, ..
            } => (BlockLevel::Soft, disallowed_topics),
            Verdict::Hard(block) => (BlockLevel::Hard, block.topics().to_vec()),
        };
        Self {
            level,
            can_join,
            message,
            disallowed_topics,
        }
    }
}

pub async fn validate_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettingsRequest>,
) -> Json<SettingsVerdict> {
    let catalog = match state
        .coordinator
        .collab()
        .catalog
        .disallowed_difficulties()
        .await
    {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "topic catalog unavailable");
            None
        }
    };
    let verdict = filter::validate(&req.topics, &req.difficulty, catalog.as_ref());
    Json(verdict.into())
}

// ── Match results ───────────────────────────────────────────────────────

pub async fn match_result(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<MatchId>,
) -> Result<Json<MatchResult>, DuelError> {
    state
        .coordinator
        .collab()
        .results
        .result(match_id)
        .await?
        .map(Json)
        .ok_or(DuelError::NotFound)
}

// ── Rating preview ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub player: i32,
    pub opponent: i32,
}

pub async fn rating_preview(Query(q): Query<PreviewQuery>) -> Json<RatingPreview> {
    Json(rating::preview(q.player, q.opponent))
}

// ── WebSocket upgrade ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub player_id: PlayerId,
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let current = state.connection_count.load(Ordering::Relaxed);
    if current >= state.max_connections {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let profiles = &state.coordinator.collab().profiles;
    let player = match profiles.player(query.player_id).await {
        Ok(Some(p)) => p,
        Ok(None) if state.dev_mode => {
            let player = dev_player(&state, query.player_id).await;
            profiles
                .create_player(&player)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            info!(player_id = player.id, username = %player.username, "created dev player");
            player
        }
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };

    Ok(ws.on_upgrade(move |socket| ws::handle_socket(state, socket, player.id, player.username)))
}

/// A dev-mode player selecting every topic that has problems.
async fn dev_player(state: &AppState, id: PlayerId) -> PlayerSnapshot {
    let catalog = state
        .coordinator
        .collab()
        .catalog
        .disallowed_difficulties()
        .await
        .unwrap_or_default();
    let every_topic: Vec<TopicId> = TopicId::all().collect();
    let topics: BTreeSet<TopicId> =
        filter::playable_pairs(&catalog, &every_topic, Difficulty::all())
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
    let levels: Vec<u8> = Difficulty::all().iter().map(|d| d.level()).collect();
    let username = format!("dev_player_{id}");
    PlayerSnapshot {
        id,
        external_handle: Some(username.clone()),
        username,
        rating: DEFAULT_RATING,
        topics: topics.into_iter().collect(),
        difficulty_levels: levels,
        repeat_allowed: true,
    }
}

#[cfg(test)]
mod tests {
    use duel_core::HardBlock;

    use super::*;

    #[test]
    fn verdict_serializes_for_settings_page() {
        let soft: SettingsVerdict = Verdict::Soft {
            disallowed_topics: vec![TopicId(9)],
            valid_topic_count: 2,
        }
        .into();
        assert_eq!(soft.level, BlockLevel::Soft);
        assert!(soft.can_join);
        assert_eq!(soft.disallowed_topics, vec![TopicId(9)]);

        let hard: SettingsVerdict = Verdict::Hard(HardBlock::NoDifficulty).into();
        let json = serde_json::to_value(&hard).unwrap();
        assert_eq!(json["level"], "hard");
        assert_eq!(json["can_join"], false);
        assert_eq!(json["message"], "Select at least one difficulty.");

        let ok = serde_json::to_value(SettingsVerdict::from(Verdict::Ok)).unwrap();
        assert!(ok.get("message").is_none());
    }
}
