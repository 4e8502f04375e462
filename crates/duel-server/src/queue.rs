//! Matchmaking pool.
//!
//! Every operation runs under one short-lived lock, so a join, a leave and a
//! sweep never observe each other half-applied and no player is handed out
//! twice.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use duel_core::protocol::{MatchId, PlayerId};
use duel_core::{Difficulty, TopicId};

use crate::collab::PlayerSnapshot;
use crate::error::DuelError;

/// A player waiting for an opponent.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player_id: PlayerId,
    pub username: String,
    pub rating: i32,
    pub external_handle: Option<String>,
    pub topics: Vec<TopicId>,
    pub difficulties: Vec<Difficulty>,
    pub repeat_allowed: bool,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn from_snapshot(player: &PlayerSnapshot, enqueued_at: Instant) -> Self {
        Self {
            player_id: player.id,
            username: player.username.clone(),
            rating: player.rating,
            external_handle: player.external_handle.clone(),
            topics: player.topics.clone(),
            difficulties: player.difficulties(),
            repeat_allowed: player.repeat_allowed,
            enqueued_at,
        }
    }
}

/// Decides whether two waiting players may be paired.
pub trait Compatibility: Send + Sync {
    fn compatible(&self, a: &QueueEntry, b: &QueueEntry, now: Instant) -> bool;
}

/// Anyone plays anyone.
pub struct OpenPairing;

impl Compatibility for OpenPairing {
    fn compatible(&self, _a: &QueueEntry, _b: &QueueEntry, _now: Instant) -> bool {
        true
    }
}

/// Pairs players whose ratings are close, widening the band once either
/// player has waited long enough.
pub struct RatingBand {
    pub max_gap: i32,
    pub widen_after: Duration,
    pub widened_gap: i32,
}

impl RatingBand {
    pub fn new(max_gap: i32) -> Self {
        Self {
            max_gap,
            widen_after: Duration::from_secs(30),
            widened_gap: max_gap * 2,
        }
    }
}

impl Compatibility for RatingBand {
    fn compatible(&self, a: &QueueEntry, b: &QueueEntry, now: Instant) -> bool {
        let longest_wait = now.saturating_duration_since(a.enqueued_at.min(b.enqueued_at));
        let gap = if longest_wait >= self.widen_after {
            self.widened_gap
        } else {
            self.max_gap
        };
        (a.rating - b.rating).abs() <= gap
    }
}

/// Two players taken out of the pool together.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub match_id: MatchId,
    /// The longer-waiting player.
    pub first: QueueEntry,
    pub second: QueueEntry,
}

impl Pairing {
    fn new(first: QueueEntry, second: QueueEntry) -> Self {
        Self {
            match_id: Uuid::new_v4(),
            first,
            second,
        }
    }

    pub fn players(&self) -> [PlayerId; 2] {
        [self.first.player_id, self.second.player_id]
    }
}

#[derive(Debug)]
pub enum JoinOutcome {
    Queued,
    Paired(Pairing),
}

#[derive(Default)]
struct Pool {
    /// Ordered by `enqueued_at`, oldest first.
    waiting: Vec<QueueEntry>,
    /// Players handed out in a pairing whose match has not resolved.
    engaged: HashSet<PlayerId>,
    /// Paired players whose match is not running yet.
    pending: HashSet<PlayerId>,
    /// Pending players who left or disconnected before their match began.
    withdrawn: HashSet<PlayerId>,
}

impl Pool {
    fn insert_ordered(&mut self, entry: QueueEntry) {
        let at = self
            .waiting
            .partition_point(|e| e.enqueued_at <= entry.enqueued_at);
        self.waiting.insert(at, entry);
    }

    fn engage(&mut self, pairing: &Pairing) {
        for id in pairing.players() {
            self.engaged.insert(id);
            self.pending.insert(id);
        }
    }
}

pub struct MatchmakingQueue {
    pool: Mutex<Pool>,
    compatibility: Box<dyn Compatibility>,
}

impl MatchmakingQueue {
    pub fn new(compatibility: Box<dyn Compatibility>) -> Self {
        Self {
            pool: Mutex::new(Pool::default()),
            compatibility,
        }
    }

    pub fn open() -> Self {
        Self::new(Box::new(OpenPairing))
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a player and pair them with the longest-waiting compatible entry.
    pub fn join(&self, entry: QueueEntry) -> Result<JoinOutcome, DuelError> {
        let mut pool = self.lock();
        if pool.engaged.contains(&entry.player_id) {
            return Err(DuelError::AlreadyInMatch);
        }
        if pool.waiting.iter().any(|e| e.player_id == entry.player_id) {
            return Err(DuelError::AlreadyQueued);
        }

        let now = entry.enqueued_at;
        let partner = pool
            .waiting
            .iter()
            .position(|e| self.compatibility.compatible(e, &entry, now));

        match partner {
            Some(idx) => {
                let first = pool.waiting.remove(idx);
                let pairing = Pairing::new(first, entry);
                pool.engage(&pairing);
                Ok(JoinOutcome::Paired(pairing))
            }
            None => {
                pool.insert_ordered(entry);
                Ok(JoinOutcome::Queued)
            }
        }
    }

    /// Take a player out of line. A player already paired but whose match
    /// has not begun is marked withdrawn, so [`begin`](Self::begin) refuses
    /// the pairing. Returns whether anything changed.
    pub fn leave(&self, player_id: PlayerId) -> bool {
        let mut pool = self.lock();
        let before = pool.waiting.len();
        pool.waiting.retain(|e| e.player_id != player_id);
        if pool.waiting.len() != before {
            return true;
        }
        pool.pending.contains(&player_id) && pool.withdrawn.insert(player_id)
    }

    /// Pair whatever the predicate now allows, oldest entries first. Only
    /// matters for predicates that change over time.
    pub fn sweep(&self, now: Instant) -> Vec<Pairing> {
        let mut pool = self.lock();
        let mut pairings = Vec::new();
        let mut i = 0;
        while i < pool.waiting.len() {
            let partner = (i + 1..pool.waiting.len()).find(|&j| {
                self.compatibility
                    .compatible(&pool.waiting[i], &pool.waiting[j], now)
            });
            match partner {
                Some(j) => {
                    let second = pool.waiting.remove(j);
                    let first = pool.waiting.remove(i);
                    let pairing = Pairing::new(first, second);
                    pool.engage(&pairing);
                    pairings.push(pairing);
                }
                None => i += 1,
            }
        }
        pairings
    }

    /// Mark a pairing's match as running. Fails if either player withdrew
    /// in the meantime; the pairing should then be requeued.
    pub fn begin(&self, pairing: &Pairing) -> bool {
        let mut pool = self.lock();
        let players = pairing.players();
        if players.iter().any(|id| pool.withdrawn.contains(id)) {
            return false;
        }
        for id in players {
            pool.pending.remove(&id);
        }
        true
    }

    /// Put the players of an unstarted pairing back, keeping their place in
    /// line. Withdrawn players are dropped. Returns who was requeued.
    pub fn requeue(&self, pairing: Pairing) -> Vec<PlayerId> {
        let mut pool = self.lock();
        let mut requeued = Vec::new();
        for entry in [pairing.first, pairing.second] {
            let id = entry.player_id;
            pool.engaged.remove(&id);
            pool.pending.remove(&id);
            if pool.withdrawn.remove(&id) {
                continue;
            }
            if !pool.waiting.iter().any(|e| e.player_id == id) {
                pool.insert_ordered(entry);
            }
            requeued.push(id);
        }
        requeued
    }

    /// The player's match is over; they may queue again.
    pub fn release(&self, player_id: PlayerId) {
        let mut pool = self.lock();
        pool.engaged.remove(&player_id);
        pool.pending.remove(&player_id);
        pool.withdrawn.remove(&player_id);
    }

    pub fn is_queued(&self, player_id: PlayerId) -> bool {
        self.lock().waiting.iter().any(|e| e.player_id == player_id)
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
