use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::difficulty::Difficulty;

pub type PlayerId = i64;
pub type MatchId = Uuid;

/// A problem assigned to a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpponentInfo {
    pub username: String,
    pub rating: i32,
}

/// Match lifecycle, as rendered by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Countdown,
    #[serde(rename = "start")]
    Starting,
    Active,
    Resolved,
}

/// How a match was decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// A player submitted an accepted solve of the assigned problem.
    Submission,
    Resignation,
    /// A player left, disconnected or idled out.
    Forfeit,
    /// Both players were gone; no rating change.
    Abandoned,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Submission => "submission",
            OutcomeKind::Resignation => "resignation",
            OutcomeKind::Forfeit => "forfeit",
            OutcomeKind::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<OutcomeKind> {
        match s {
            "submission" => Some(OutcomeKind::Submission),
            "resignation" => Some(OutcomeKind::Resignation),
            "forfeit" => Some(OutcomeKind::Forfeit),
            "abandoned" => Some(OutcomeKind::Abandoned),
            _ => None,
        }
    }
}

/// Immutable record of a resolved match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: MatchId,
    pub player_a: PlayerId,
    pub player_b: PlayerId,
    pub winner_id: Option<PlayerId>,
    pub loser_id: Option<PlayerId>,
    pub outcome: OutcomeKind,
    pub elo_before_a: i32,
    pub elo_before_b: i32,
    pub elo_after_a: i32,
    pub elo_after_b: i32,
    pub duration_seconds: i64,
    pub problem_slug: String,
    pub rating_formula: String,
}

impl MatchResult {
    /// Rating change for one participant.
    pub fn delta_for(&self, player: PlayerId) -> Option<i32> {
        if player == self.player_a {
            Some(self.elo_after_a - self.elo_before_a)
        } else if player == self.player_b {
            Some(self.elo_after_b - self.elo_before_b)
        } else {
            None
        }
    }

    pub fn rating_after(&self, player: PlayerId) -> Option<i32> {
        if player == self.player_a {
            Some(self.elo_after_a)
        } else if player == self.player_b {
            Some(self.elo_after_b)
        } else {
            None
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinQueue,
    LeaveQueue,
    SubmitSolution { match_id: MatchId },
    ResignMatch { match_id: MatchId },
    Ping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Matched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerResult {
    Won,
    Lost,
    Void,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AlreadyQueued,
    AlreadyInMatch,
    NotInMatch,
    NotActive,
    StaleSubmission,
    ExternalService,
    AlreadyResolved,
    Malformed,
    RateLimited,
    UnknownPlayer,
    NotFound,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    QueueJoined {
        status: QueueStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_id: Option<MatchId>,
        /// Soft-block warning about topics that can never be drawn.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    QueueLeft,
    MatchFound {
        match_id: MatchId,
        problem: Problem,
        opponent: OpponentInfo,
    },
    TimerUpdate {
        match_id: MatchId,
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        countdown: Option<u32>,
        /// Unix milliseconds at which the active phase began.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_timestamp: Option<i64>,
    },
    MatchCompleted {
        match_id: MatchId,
        result: PlayerResult,
        reason: OutcomeKind,
        rating_delta: i32,
        new_rating: i32,
        opponent_rating_delta: i32,
    },
    OpponentDisconnected,
    OpponentReconnected,
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Pong,
}
