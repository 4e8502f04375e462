//! One live duel: phase clock, submission checks and resolution.
//!
//! A session is plain data guarded by the coordinator's match table. Nothing
//! here awaits; the coordinator calls out to the judge between
//! [`MatchSession::check_submit`] and [`MatchSession::verify_submission`].

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::time::Instant;

use duel_core::protocol::{
    MatchId, MatchResult, OpponentInfo, OutcomeKind, Phase, PlayerId, PlayerResult, Problem,
    ServerMessage,
};
use duel_core::rating::{self, RATING_FORMULA, RatingDeltas};

use crate::collab::AcceptedSolve;
use crate::config::MatchTiming;
use crate::error::DuelError;
use crate::queue::QueueEntry;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: PlayerId,
    pub username: String,
    /// Rating when the match was formed.
    pub rating: i32,
    pub handle: Option<String>,
    pub last_seen: Instant,
    pub connected: bool,
    disconnected_at: Option<Instant>,
    next_submit_at: Option<Instant>,
}

impl Participant {
    fn from_entry(entry: &QueueEntry, now: Instant) -> Self {
        Self {
            id: entry.player_id,
            username: entry.username.clone(),
            rating: entry.rating,
            handle: entry.external_handle.clone(),
            last_seen: now,
            connected: true,
            disconnected_at: None,
            next_submit_at: None,
        }
    }
}

/// How a match ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Submitted { winner: PlayerId },
    Resigned { loser: PlayerId },
    Forfeited { loser: PlayerId },
    Abandoned,
}

#[derive(Debug)]
pub struct MatchSession {
    pub id: MatchId,
    pub participants: [Participant; 2],
    pub problem: Problem,
    pub phase: Phase,
    /// Countdown value currently on screen.
    pub countdown: u32,
    pub start_timestamp: Option<DateTime<Utc>>,
    active_since: Option<Instant>,
    resolved_at: Option<Instant>,
    result: Option<MatchResult>,
    /// The result could not be stored yet.
    unrecorded: bool,
}

impl MatchSession {
    pub fn new(
        id: MatchId,
        first: &QueueEntry,
        second: &QueueEntry,
        problem: Problem,
        timing: &MatchTiming,
        now: Instant,
    ) -> Self {
        let phase = if timing.countdown_ticks == 0 {
            Phase::Starting
        } else {
            Phase::Countdown
        };
        Self {
            id,
            participants: [
                Participant::from_entry(first, now),
                Participant::from_entry(second, now),
            ],
            problem,
            phase,
            countdown: timing.countdown_ticks,
            start_timestamp: None,
            active_since: None,
            resolved_at: None,
            result: None,
            unrecorded: false,
        }
    }

    pub fn players(&self) -> [PlayerId; 2] {
        [self.participants[0].id, self.participants[1].id]
    }

    pub fn participant(&self, player: PlayerId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == player)
    }

    fn participant_mut(&mut self, player: PlayerId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == player)
    }

    pub fn opponent_of(&self, player: PlayerId) -> Option<&Participant> {
        if self.participant(player).is_none() {
            return None;
        }
        self.participants.iter().find(|p| p.id != player)
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<&MatchResult> {
        self.result.as_ref()
    }

    pub fn resolved_at(&self) -> Option<Instant> {
        self.resolved_at
    }

    pub fn mark_unrecorded(&mut self) {
        self.unrecorded = self.result.is_some();
    }

    /// Hand out the result for another storage attempt. Only one caller gets
    /// it per failure.
    pub fn take_unrecorded(&mut self) -> Option<MatchResult> {
        if !std::mem::take(&mut self.unrecorded) {
            return None;
        }
        self.result.clone()
    }

    /// How long the current phase lasts before the next clock step, or
    /// `None` once the clock has nothing left to do.
    pub fn current_wait(&self, timing: &MatchTiming) -> Option<Duration> {
        match self.phase {
            Phase::Countdown => Some(timing.tick),
            Phase::Starting => Some(timing.starting),
            Phase::Active | Phase::Resolved => None,
        }
    }

    /// Move the clock one step. Returns false if there was nothing to do.
    pub fn advance(&mut self, now: Instant, now_utc: DateTime<Utc>) -> bool {
        match self.phase {
            Phase::Countdown if self.countdown > 1 => {
                self.countdown -= 1;
            }
            Phase::Countdown => {
                self.countdown = 0;
                self.phase = Phase::Starting;
            }
            Phase::Starting => {
                self.phase = Phase::Active;
                self.active_since = Some(now);
                self.start_timestamp = Some(now_utc);
            }
            Phase::Active | Phase::Resolved => return false,
        }
        true
    }

    pub fn timer_update(&self) -> ServerMessage {
        ServerMessage::TimerUpdate {
            match_id: self.id,
            phase: self.phase,
            countdown: (self.phase == Phase::Countdown).then_some(self.countdown),
            start_timestamp: self.start_timestamp.map(|t| t.timestamp_millis()),
        }
    }

    pub fn match_found_for(&self, player: PlayerId) -> Option<ServerMessage> {
        let opponent = self.opponent_of(player)?;
        Some(ServerMessage::MatchFound {
            match_id: self.id,
            problem: self.problem.clone(),
            opponent: OpponentInfo {
                username: opponent.username.clone(),
                rating: opponent.rating,
            },
        })
    }

    /// Record that `player` was heard from.
    pub fn touch(&mut self, player: PlayerId, now: Instant) {
        if let Some(p) = self.participant_mut(player) {
            p.last_seen = now;
        }
    }

    pub fn set_connected(&mut self, player: PlayerId, connected: bool, now: Instant) {
        if let Some(p) = self.participant_mut(player) {
            p.connected = connected;
            p.disconnected_at = (!connected).then_some(now);
        }
    }

    /// Players whose liveness window has run out. A player without a socket
    /// gets `heartbeat_grace` in every phase.
    pub fn expired(&self, now: Instant, timing: &MatchTiming) -> Vec<PlayerId> {
        if self.is_resolved() {
            return Vec::new();
        }
        let window = match self.phase {
            Phase::Active => timing.idle_timeout,
            _ => timing.heartbeat_grace,
        };
        self.participants
            .iter()
            .filter(|p| {
                let gone = p.disconnected_at.is_some_and(|at| {
                    now.saturating_duration_since(at) > timing.heartbeat_grace
                });
                gone || now.saturating_duration_since(p.last_seen) > window
            })
            .map(|p| p.id)
            .collect()
    }

    /// Checks that may reject a submission before the judge is asked.
    /// Returns the handle to look up.
    pub fn check_submit(&self, player: PlayerId, now: Instant) -> Result<String, DuelError> {
        if self.is_resolved() {
            return Err(DuelError::AlreadyResolved);
        }
        let participant = self.participant(player).ok_or(DuelError::NotInMatch)?;
        if self.phase != Phase::Active {
            return Err(DuelError::NotActive);
        }
        if let Some(until) = participant.next_submit_at {
            if until > now {
                return Err(DuelError::StaleSubmission {
                    retry_after: until - now,
                });
            }
        }
        participant.handle.clone().ok_or(DuelError::MissingHandle)
    }

    /// Judge the latest accepted solve against the assigned problem. A miss
    /// starts the player's cooldown.
    pub fn verify_submission(
        &mut self,
        player: PlayerId,
        solve: Option<&AcceptedSolve>,
        now: Instant,
        cooldown: Duration,
    ) -> Result<(), DuelError> {
        if self.is_resolved() {
            return Err(DuelError::AlreadyResolved);
        }
        let start = self.start_timestamp.ok_or(DuelError::NotActive)?;
        // The judge reports whole seconds.
        let start = start
            .duration_trunc(TimeDelta::seconds(1))
            .unwrap_or(start);

        let accepted = solve
            .is_some_and(|s| s.problem_slug == self.problem.slug && s.solved_at >= start);
        if accepted {
            return Ok(());
        }

        let participant = self.participant_mut(player).ok_or(DuelError::NotInMatch)?;
        participant.next_submit_at = Some(now + cooldown);
        Err(DuelError::StaleSubmission {
            retry_after: cooldown,
        })
    }

    /// Close the match. Only the first call succeeds.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        now: Instant,
    ) -> Result<MatchResult, DuelError> {
        if self.is_resolved() {
            return Err(DuelError::AlreadyResolved);
        }

        let (a, b) = (&self.participants[0], &self.participants[1]);
        let decided = match resolution {
            Resolution::Submitted { winner } => Some((winner, OutcomeKind::Submission)),
            Resolution::Resigned { loser } => Some((self.other(loser)?, OutcomeKind::Resignation)),
            Resolution::Forfeited { loser } => Some((self.other(loser)?, OutcomeKind::Forfeit)),
            Resolution::Abandoned => None,
        };

        let (winner_id, loser_id, outcome, after_a, after_b) = match decided {
            Some((winner, outcome)) => {
                let loser = self.other(winner)?;
                let (w, l) = if winner == a.id { (a, b) } else { (b, a) };
                let RatingDeltas {
                    winner: dw,
                    loser: dl,
                } = rating::compute(w.rating, l.rating);
                let (da, db) = if winner == a.id { (dw, dl) } else { (dl, dw) };
                (
                    Some(winner),
                    Some(loser),
                    outcome,
                    a.rating + da,
                    b.rating + db,
                )
            }
            None => (None, None, OutcomeKind::Abandoned, a.rating, b.rating),
        };

        let duration_seconds = self
            .active_since
            .map(|t| now.saturating_duration_since(t).as_secs() as i64)
            .unwrap_or(0);

        let result = MatchResult {
            match_id: self.id,
            player_a: a.id,
            player_b: b.id,
            winner_id,
            loser_id,
            outcome,
            elo_before_a: a.rating,
            elo_before_b: b.rating,
            elo_after_a: after_a,
            elo_after_b: after_b,
            duration_seconds,
            problem_slug: self.problem.slug.clone(),
            rating_formula: RATING_FORMULA.to_string(),
        };

        self.phase = Phase::Resolved;
        self.resolved_at = Some(now);
        self.result = Some(result.clone());
        Ok(result)
    }

    fn other(&self, player: PlayerId) -> Result<PlayerId, DuelError> {
        self.opponent_of(player)
            .map(|p| p.id)
            .ok_or(DuelError::NotInMatch)
    }
}

/// The `match_completed` message one participant receives.
pub fn completed_message(result: &MatchResult, player: PlayerId) -> Option<ServerMessage> {
    let opponent = if player == result.player_a {
        result.player_b
    } else {
        result.player_a
    };
    let outcome = if result.winner_id == Some(player) {
        PlayerResult::Won
    } else if result.loser_id == Some(player) {
        PlayerResult::Lost
    } else {
        PlayerResult::Void
    };
    Some(ServerMessage::MatchCompleted {
        match_id: result.match_id,
        result: outcome,
        reason: result.outcome,
        rating_delta: result.delta_for(player)?,
        new_rating: result.rating_after(player)?,
        opponent_rating_delta: result.delta_for(opponent)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use duel_core::{Difficulty, TopicId};
    use uuid::Uuid;

    use super::*;

    fn entry(id: PlayerId, rating: i32, now: Instant) -> QueueEntry {
        QueueEntry {
            player_id: id,
            username: format!("player{id}"),
            rating,
            external_handle: Some(format!("lc_player{id}")),
            topics: vec![TopicId(0)],
            difficulties: vec![Difficulty::Easy],
            repeat_allowed: true,
            enqueued_at: now,
        }
    }

    fn session(now: Instant) -> MatchSession {
        let problem = Problem {
            id: 1,
            title: "Two Sum".into(),
            slug: "two-sum".into(),
            difficulty: Difficulty::Easy,
            tags: vec!["Array".into()],
        };
        MatchSession::new(
            Uuid::new_v4(),
            &entry(1, 1500, now),
            &entry(2, 1500, now),
            problem,
            &MatchTiming::default(),
            now,
        )
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(400)
    }

    fn activate(session: &mut MatchSession, now: Instant) {
        while session.advance(now, start()) {}
        assert_eq!(session.phase, Phase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_counts_down_then_starts() {
        let now = Instant::now();
        let mut s = session(now);
        let mut seen = vec![(s.phase, s.countdown)];
        while s.advance(now, start()) {
            seen.push((s.phase, s.countdown));
        }
        assert_eq!(
            seen,
            vec![
                (Phase::Countdown, 3),
                (Phase::Countdown, 2),
                (Phase::Countdown, 1),
                (Phase::Starting, 0),
                (Phase::Active, 0),
            ]
        );
        match s.timer_update() {
            ServerMessage::TimerUpdate {
                phase,
                countdown,
                start_timestamp,
                ..
            } => {
                assert_eq!(phase, Phase::Active);
                assert_eq!(countdown, None);
                assert_eq!(start_timestamp, Some(start().timestamp_millis()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_before_active_is_rejected() {
        let now = Instant::now();
        let s = session(now);
        assert!(matches!(s.check_submit(1, now), Err(DuelError::NotActive)));
        assert!(matches!(s.check_submit(9, now), Err(DuelError::NotInMatch)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_submission_starts_cooldown() {
        let now = Instant::now();
        let mut s = session(now);
        activate(&mut s, now);

        let old = AcceptedSolve {
            problem_slug: "two-sum".into(),
            solved_at: start() - TimeDelta::minutes(5),
        };
        let cooldown = Duration::from_secs(5);
        assert!(matches!(
            s.verify_submission(1, Some(&old), now, cooldown),
            Err(DuelError::StaleSubmission { .. })
        ));

        let later = now + Duration::from_secs(2);
        match s.check_submit(1, later) {
            Err(DuelError::StaleSubmission { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(3))
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        // The opponent is unaffected.
        assert_eq!(s.check_submit(2, later).unwrap(), "lc_player2");
        assert_eq!(
            s.check_submit(1, now + cooldown).unwrap(),
            "lc_player1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn solve_in_the_starting_second_counts() {
        let now = Instant::now();
        let mut s = session(now);
        activate(&mut s, now);
        let solve = AcceptedSolve {
            problem_slug: "two-sum".into(),
            solved_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        };
        assert!(
            s.verify_submission(2, Some(&solve), now, Duration::from_secs(5))
                .is_ok()
        );

        let wrong = AcceptedSolve {
            problem_slug: "valid-parentheses".into(),
            ..solve
        };
        assert!(
            s.verify_submission(2, Some(&wrong), now, Duration::from_secs(5))
                .is_err()
        );
        assert!(
            s.verify_submission(2, None, now, Duration::from_secs(5))
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_exactly_once() {
        let now = Instant::now();
        let mut s = session(now);
        activate(&mut s, now);

        let result = s
            .resolve(
                Resolution::Submitted { winner: 2 },
                now + Duration::from_secs(95),
            )
            .unwrap();
        assert_eq!(result.winner_id, Some(2));
        assert_eq!(result.loser_id, Some(1));
        assert_eq!(result.outcome, OutcomeKind::Submission);
        assert_eq!((result.elo_after_a, result.elo_after_b), (1484, 1516));
        assert_eq!(result.duration_seconds, 95);
        assert_eq!(result.rating_formula, "elo-k32-v1");

        assert!(matches!(
            s.resolve(Resolution::Resigned { loser: 2 }, now),
            Err(DuelError::AlreadyResolved)
        ));
        assert!(matches!(
            s.check_submit(1, now),
            Err(DuelError::AlreadyResolved)
        ));
        assert_eq!(s.result(), Some(&result));
    }

    #[tokio::test(start_paused = true)]
    async fn resign_during_countdown_loses() {
        let now = Instant::now();
        let mut s = session(now);
        let result = s.resolve(Resolution::Resigned { loser: 1 }, now).unwrap();
        assert_eq!(result.winner_id, Some(2));
        assert_eq!(result.outcome, OutcomeKind::Resignation);
        assert_eq!(result.duration_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_match_is_void() {
        let now = Instant::now();
        let mut s = session(now);
        let result = s.resolve(Resolution::Abandoned, now).unwrap();
        assert_eq!(result.winner_id, None);
        assert_eq!(result.delta_for(1), Some(0));
        assert_eq!(result.delta_for(2), Some(0));

        match completed_message(&result, 1).unwrap() {
            ServerMessage::MatchCompleted { result, .. } => {
                assert_eq!(result, PlayerResult::Void)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_window_depends_on_phase() {
        let now = Instant::now();
        let timing = MatchTiming::default();
        let mut s = session(now);

        let later = now + timing.heartbeat_grace + Duration::from_secs(1);
        s.touch(2, later);
        assert_eq!(s.expired(later, &timing), vec![1]);

        activate(&mut s, later);
        s.touch(1, later);
        let idle = later + timing.heartbeat_grace + Duration::from_secs(1);
        assert!(s.expired(idle, &timing).is_empty());

        let gone = later + timing.idle_timeout + Duration::from_secs(1);
        assert_eq!(s.expired(gone, &timing), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_socket_gets_grace_in_every_phase() {
        let now = Instant::now();
        let timing = MatchTiming::default();
        let mut s = session(now);
        activate(&mut s, now);

        s.set_connected(1, false, now);
        let within = now + timing.heartbeat_grace;
        s.touch(2, within);
        assert!(s.expired(within, &timing).is_empty());

        let past = within + Duration::from_secs(1);
        s.touch(2, past);
        assert_eq!(s.expired(past, &timing), vec![1]);

        // Coming back clears the clock.
        s.set_connected(1, true, past);
        s.touch(1, past);
        assert!(s.expired(past, &timing).is_empty());
    }

    #[test]
    fn completed_message_reports_both_deltas() {
        let result = MatchResult {
            match_id: Uuid::nil(),
            player_a: 1,
            player_b: 2,
            winner_id: Some(1),
            loser_id: Some(2),
            outcome: OutcomeKind::Forfeit,
            elo_before_a: 1400,
            elo_before_b: 1600,
            elo_after_a: 1424,
            elo_after_b: 1576,
            duration_seconds: 10,
            problem_slug: "two-sum".into(),
            rating_formula: RATING_FORMULA.into(),
        };
        assert_eq!(
            completed_message(&result, 2),
            Some(ServerMessage::MatchCompleted {
                match_id: Uuid::nil(),
                result: PlayerResult::Lost,
                reason: OutcomeKind::Forfeit,
                rating_delta: -24,
                new_rating: 1576,
                opponent_rating_delta: 24,
            })
        );
    }
}
