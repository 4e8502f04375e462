//! Services the matchmaking core calls but does not own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use duel_core::protocol::{MatchId, MatchResult, PlayerId, Problem};
use duel_core::{Difficulty, DisallowedCatalog, TopicId};

use crate::error::DuelError;

/// What the core reads about a player when they connect or join the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: PlayerId,
    pub username: String,
    /// Account name on the judge, used to look up accepted solves.
    pub external_handle: Option<String>,
    pub rating: i32,
    pub topics: Vec<TopicId>,
    /// Raw settings values, 1 = Easy .. 3 = Hard.
    pub difficulty_levels: Vec<u8>,
    pub repeat_allowed: bool,
}

impl PlayerSnapshot {
    pub fn difficulties(&self) -> Vec<Difficulty> {
        self.difficulty_levels
            .iter()
            .filter_map(|l| Difficulty::from_level(*l))
            .collect()
    }
}

/// The latest accepted solve the judge knows about for a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSolve {
    pub problem_slug: String,
    pub solved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProblemFilter {
    pub topics: Vec<TopicId>,
    pub difficulties: Vec<Difficulty>,
    /// Problems either player has already played and does not want again.
    pub exclude_slugs: Vec<String>,
}

#[async_trait]
pub trait ProblemSource: Send + Sync {
    async fn random_problem(&self, filter: &ProblemFilter) -> Result<Problem, DuelError>;
}

#[async_trait]
pub trait SubmissionOracle: Send + Sync {
    async fn most_recent_accepted(&self, handle: &str)
    -> Result<Option<AcceptedSolve>, DuelError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn player(&self, id: PlayerId) -> Result<Option<PlayerSnapshot>, DuelError>;

    async fn rating(&self, id: PlayerId) -> Result<i32, DuelError> {
        self.player(id)
            .await?
            .map(|p| p.rating)
            .ok_or(DuelError::UnknownPlayer)
    }

    /// Adds `delta` to the stored rating and returns the new value.
    async fn apply_rating_delta(&self, id: PlayerId, delta: i32) -> Result<i32, DuelError>;

    async fn create_player(&self, player: &PlayerSnapshot) -> Result<(), DuelError>;
}

#[async_trait]
pub trait TopicCatalog: Send + Sync {
    async fn disallowed_difficulties(&self) -> Result<DisallowedCatalog, DuelError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn record(&self, result: &MatchResult) -> Result<(), DuelError>;

    async fn result(&self, match_id: MatchId) -> Result<Option<MatchResult>, DuelError>;

    /// Slugs of problems the player has already been assigned.
    async fn played_slugs(&self, player: PlayerId) -> Result<Vec<String>, DuelError>;
}

/// Every external service the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub problems: Arc<dyn ProblemSource>,
    pub oracle: Arc<dyn SubmissionOracle>,
    pub profiles: Arc<dyn ProfileStore>,
    pub catalog: Arc<dyn TopicCatalog>,
    pub results: Arc<dyn ResultStore>,
}
