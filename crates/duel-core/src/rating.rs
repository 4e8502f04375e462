//! Elo rating changes for a decided duel.
//!
//! Formula `elo-k32-v1`: with `E(a, b) = 1 / (1 + 10^((b - a) / 400))`,
//! the winner gains `round(K * (1 - E(w, l)))` and the loser changes by
//! `round(K * (0 - E(l, w)))`, `K = 32`, rounding half away from zero.
//! A loser's delta is capped so the rating never drops below
//! [`RATING_FLOOR`]. The formula name is stored with every match result;
//! changing any constant here requires a new name.

use serde::{Deserialize, Serialize};

/// Starting ELO rating for new players
pub const DEFAULT_RATING: i32 = 1200;

/// Lowest rating a loss can take a player to.
pub const RATING_FLOOR: i32 = 100;

/// Versioned name of the formula implemented by [`compute`].
pub const RATING_FORMULA: &str = "elo-k32-v1";

/// K-factor for ELO calculation
const K: f64 = 32.0;

/// Rating changes produced by one decided match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingDeltas {
    pub winner: i32,
    pub loser: i32,
}

impl RatingDeltas {
    /// Deltas for a void match.
    pub const ZERO: RatingDeltas = RatingDeltas { winner: 0, loser: 0 };
}

/// Probability that a player rated `player` beats one rated `opponent`.
pub fn expected_score(player: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - player) as f64 / 400.0))
}

/// Rating deltas for a match won by `winner_rating` over `loser_rating`.
pub fn compute(winner_rating: i32, loser_rating: i32) -> RatingDeltas {
    let winner = change(winner_rating, loser_rating, 1.0);
    let mut loser = change(loser_rating, winner_rating, 0.0);
    if loser_rating + loser < RATING_FLOOR {
        loser = (RATING_FLOOR - loser_rating).min(0);
    }
    RatingDeltas { winner, loser }
}

fn change(player: i32, opponent: i32, score: f64) -> i32 {
    (K * (score - expected_score(player, opponent))).round() as i32
}

/// What a match between two ratings would do to `player`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingPreview {
    /// Win probability in percent, one decimal place.
    pub win_probability: f64,
    pub on_win: i32,
    pub on_loss: i32,
}

pub fn preview(player: i32, opponent: i32) -> RatingPreview {
    let expected = expected_score(player, opponent);
    RatingPreview {
        win_probability: (expected * 1000.0).round() / 10.0,
        on_win: compute(player, opponent).winner,
        on_loss: compute(opponent, player).loser,
    }
}
