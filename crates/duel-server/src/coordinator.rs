//! Routes player messages to the queue and live matches.
//!
//! Lock discipline: the match table, the player index and the connection
//! table are never locked at the same time, and no guard is held across an
//! `.await`. Messages are collected under a guard and sent after it drops.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use duel_core::filter::{self, Verdict};
use duel_core::protocol::{
    ClientMessage, MatchId, MatchResult, OutcomeKind, Phase, PlayerId, QueueStatus, ServerMessage,
};

use crate::collab::{Collaborators, ProblemFilter};
use crate::config::MatchTiming;
use crate::error::DuelError;
use crate::queue::{JoinOutcome, MatchmakingQueue, Pairing, QueueEntry};
use crate::session::{MatchSession, Resolution, completed_message};
use crate::state::ConnectionHandle;

pub struct MatchCoordinator {
    queue: MatchmakingQueue,
    sessions: DashMap<MatchId, MatchSession>,
    player_matches: DashMap<PlayerId, MatchId>,
    connections: DashMap<PlayerId, ConnectionHandle>,
    collab: Collaborators,
    timing: MatchTiming,
    next_conn_id: AtomicU64,
}

impl MatchCoordinator {
    pub fn new(queue: MatchmakingQueue, collab: Collaborators, timing: MatchTiming) -> Arc<Self> {
        Arc::new(Self {
            queue,
            sessions: DashMap::new(),
            player_matches: DashMap::new(),
            connections: DashMap::new(),
            collab,
            timing,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn collab(&self) -> &Collaborators {
        &self.collab
    }

    pub fn queue(&self) -> &MatchmakingQueue {
        &self.queue
    }

    /// The player's match, resolved or not, while it is still retained.
    pub fn match_of(&self, player_id: PlayerId) -> Option<MatchId> {
        self.player_matches.get(&player_id).map(|m| *m)
    }

    pub fn live_matches(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_resolved()).count()
    }

    // -- Connections ----------------------------------------------------------

    /// Register a socket for `player_id`. A player in a live match gets the
    /// match and the current clock replayed.
    pub fn attach(
        &self,
        player_id: PlayerId,
        username: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            player_id,
            ConnectionHandle {
                player_id,
                username: username.to_string(),
                conn_id,
                tx,
            },
        );
        debug!(player_id, conn_id, "connection attached");

        let Some(match_id) = self.match_of(player_id) else {
            return conn_id;
        };
        let replay = self.sessions.get_mut(&match_id).and_then(|mut s| {
            if s.is_resolved() {
                return None;
            }
            let was_connected = s.participant(player_id)?.connected;
            let now = Instant::now();
            s.set_connected(player_id, true, now);
            s.touch(player_id, now);
            let found = s.match_found_for(player_id)?;
            let opponent = s.opponent_of(player_id)?.id;
            Some((found, s.timer_update(), opponent, was_connected))
        });

        if let Some((found, timer, opponent, was_connected)) = replay {
            info!(player_id, match_id = %match_id, "player rejoined live match");
            self.send_to(player_id, found);
            self.send_to(player_id, timer);
            if !was_connected {
                self.send_to(opponent, ServerMessage::OpponentReconnected);
            }
        }
        conn_id
    }

    /// Drop a socket. Ignored if the player has already reconnected on a
    /// newer socket.
    pub fn detach(&self, player_id: PlayerId, conn_id: u64) {
        let removed = self
            .connections
            .remove_if(&player_id, |_, c| c.conn_id == conn_id)
            .is_some();
        if !removed {
            return;
        }
        if self.queue.leave(player_id) {
            debug!(player_id, "disconnected player removed from queue");
        }

        let Some(match_id) = self.match_of(player_id) else {
            return;
        };
        let opponent = self.sessions.get_mut(&match_id).and_then(|mut s| {
            if s.is_resolved() {
                return None;
            }
            s.set_connected(player_id, false, Instant::now());
            s.opponent_of(player_id).map(|p| p.id)
        });
        if let Some(opponent) = opponent {
            info!(player_id, match_id = %match_id, "player disconnected from live match");
            self.send_to(opponent, ServerMessage::OpponentDisconnected);
        }
    }

    pub fn send_to(&self, player_id: PlayerId, msg: ServerMessage) {
        if let Some(conn) = self.connections.get(&player_id) {
            let _ = conn.tx.send(msg);
        }
    }

    pub fn connected_players(&self) -> usize {
        self.connections.len()
    }

    // -- Inbound messages -----------------------------------------------------

    /// Dispatch one client message. Failures are reported to the sender only.
    #[instrument(skip(self))]
    pub async fn handle(self: &Arc<Self>, player_id: PlayerId, msg: ClientMessage) {
        self.touch(player_id);

        let outcome = match msg {
            ClientMessage::JoinQueue => self.join_queue(player_id).await,
            ClientMessage::LeaveQueue => self.leave_queue(player_id).await,
            ClientMessage::SubmitSolution { match_id } => self.submit(player_id, match_id).await,
            ClientMessage::ResignMatch { match_id } => self.resign(player_id, match_id).await,
            ClientMessage::Ping => {
                self.send_to(player_id, ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            if e.is_benign() {
                debug!(player_id, error = %e, "request rejected");
            } else {
                warn!(player_id, error = %e, "request failed");
            }
            self.send_to(player_id, e.to_message());
        }
    }

    fn touch(&self, player_id: PlayerId) {
        if let Some(match_id) = self.match_of(player_id) {
            if let Some(mut session) = self.sessions.get_mut(&match_id) {
                session.touch(player_id, Instant::now());
            }
        }
    }

    fn in_live_match(&self, player_id: PlayerId) -> bool {
        self.match_of(player_id)
            .and_then(|m| self.sessions.get(&m).map(|s| !s.is_resolved()))
            .unwrap_or(false)
    }

    async fn join_queue(self: &Arc<Self>, player_id: PlayerId) -> Result<(), DuelError> {
        if self.in_live_match(player_id) {
            return Err(DuelError::AlreadyInMatch);
        }
        if self.queue.is_queued(player_id) {
            return Err(DuelError::AlreadyQueued);
        }

        let profile = self
            .collab
            .profiles
            .player(player_id)
            .await?
            .ok_or(DuelError::UnknownPlayer)?;

        let catalog = match self.collab.catalog.disallowed_difficulties().await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "topic catalog unavailable, blocking queue join");
                None
            }
        };
        let verdict = filter::validate(
            &profile.topics,
            &profile.difficulty_levels,
            catalog.as_ref(),
        );

        let mut entry = QueueEntry::from_snapshot(&profile, Instant::now());
        let warning = verdict.message();
        match verdict {
            Verdict::Hard(block) => return Err(block.into()),
            Verdict::Soft {
                disallowed_topics, ..
            } => entry.topics.retain(|t| !disallowed_topics.contains(t)),
            Verdict::Ok => {}
        }

        match self.queue.join(entry)? {
            JoinOutcome::Queued => {
                info!(player_id, waiting = self.queue.len(), "player queued");
                self.send_to(
                    player_id,
                    ServerMessage::QueueJoined {
                        status: QueueStatus::Queued,
                        match_id: None,
                        warning,
                    },
                );
            }
            JoinOutcome::Paired(pairing) => {
                self.send_to(
                    player_id,
                    ServerMessage::QueueJoined {
                        status: QueueStatus::Matched,
                        match_id: Some(pairing.match_id),
                        warning,
                    },
                );
                self.start_match(pairing).await;
            }
        }
        Ok(())
    }

    async fn leave_queue(self: &Arc<Self>, player_id: PlayerId) -> Result<(), DuelError> {
        if self.queue.leave(player_id) {
            info!(player_id, "player left queue");
            self.send_to(player_id, ServerMessage::QueueLeft);
            return Ok(());
        }

        // Backing out of a match that has not started yet counts as a forfeit.
        let pending = self.match_of(player_id).filter(|m| {
            self.sessions.get(m).is_some_and(|s| {
                !s.is_resolved() && matches!(s.phase, Phase::Countdown | Phase::Starting)
            })
        });
        self.send_to(player_id, ServerMessage::QueueLeft);
        if let Some(match_id) = pending {
            self.resolve(match_id, Resolution::Forfeited { loser: player_id })
                .await?;
        }
        Ok(())
    }

    async fn submit(&self, player_id: PlayerId, match_id: MatchId) -> Result<(), DuelError> {
        let handle = {
            let session = self.sessions.get(&match_id).ok_or(DuelError::NotInMatch)?;
            session.check_submit(player_id, Instant::now())?
        };

        let solve = self.collab.oracle.most_recent_accepted(&handle).await?;

        let result = {
            let mut session = self
                .sessions
                .get_mut(&match_id)
                .ok_or(DuelError::NotInMatch)?;
            let now = Instant::now();
            session.verify_submission(
                player_id,
                solve.as_ref(),
                now,
                self.timing.submit_cooldown,
            )?;
            session.resolve(Resolution::Submitted { winner: player_id }, now)?
        };
        self.complete(result).await;
        Ok(())
    }

    async fn resign(&self, player_id: PlayerId, match_id: MatchId) -> Result<(), DuelError> {
        let is_participant = self
            .sessions
            .get(&match_id)
            .ok_or(DuelError::NotInMatch)?
            .participant(player_id)
            .is_some();
        if !is_participant {
            return Err(DuelError::NotInMatch);
        }
        self.resolve(match_id, Resolution::Resigned { loser: player_id })
            .await
    }

    async fn resolve(&self, match_id: MatchId, resolution: Resolution) -> Result<(), DuelError> {
        let result = self
            .sessions
            .get_mut(&match_id)
            .ok_or(DuelError::NotInMatch)?
            .resolve(resolution, Instant::now())?;
        self.complete(result).await;
        Ok(())
    }

    // -- Match lifecycle ------------------------------------------------------

    async fn problem_filter(&self, pairing: &Pairing) -> Result<ProblemFilter, DuelError> {
        let (a, b) = (&pairing.first, &pairing.second);

        let topics_a: BTreeSet<_> = a.topics.iter().copied().collect();
        let topics_b: BTreeSet<_> = b.topics.iter().copied().collect();
        let mut topics: Vec<_> = topics_a.intersection(&topics_b).copied().collect();
        if topics.is_empty() {
            topics = topics_a.union(&topics_b).copied().collect();
        }

        let diffs_a: BTreeSet<_> = a.difficulties.iter().copied().collect();
        let diffs_b: BTreeSet<_> = b.difficulties.iter().copied().collect();
        let mut difficulties: Vec<_> = diffs_a.intersection(&diffs_b).copied().collect();
        if difficulties.is_empty() {
            difficulties = diffs_a.union(&diffs_b).copied().collect();
        }

        let mut exclude_slugs = Vec::new();
        for entry in [a, b] {
            if !entry.repeat_allowed {
                exclude_slugs.extend(self.collab.results.played_slugs(entry.player_id).await?);
            }
        }
        exclude_slugs.sort();
        exclude_slugs.dedup();

        Ok(ProblemFilter {
            topics,
            difficulties,
            exclude_slugs,
        })
    }

    /// Turn a pairing into a live match, or put the players back in line if
    /// no problem can be found or one of them left during the lookup.
    async fn start_match(self: &Arc<Self>, pairing: Pairing) {
        let match_id = pairing.match_id;
        let problem = match self.problem_filter(&pairing).await {
            Ok(filter) => self.collab.problems.random_problem(&filter).await,
            Err(e) => Err(e),
        };
        let problem = match problem {
            Ok(p) => p,
            Err(e) => {
                warn!(match_id = %match_id, error = %e, "no problem for pairing, requeueing");
                self.return_to_queue(pairing, Some(&e));
                return;
            }
        };
        if !self.queue.begin(&pairing) {
            info!(match_id = %match_id, "player withdrew before match start");
            self.return_to_queue(pairing, None);
            return;
        }

        let session = MatchSession::new(
            match_id,
            &pairing.first,
            &pairing.second,
            problem,
            &self.timing,
            Instant::now(),
        );
        let players = session.players();
        let found: Vec<_> = players
            .iter()
            .filter_map(|p| session.match_found_for(*p).map(|m| (*p, m)))
            .collect();
        let timer = session.timer_update();

        info!(
            match_id = %match_id,
            player_a = players[0],
            player_b = players[1],
            problem = %session.problem.slug,
            "match created"
        );
        self.sessions.insert(match_id, session);
        for player in players {
            self.player_matches.insert(player, match_id);
        }
        // A socket that closed after `begin` was not seen by `detach`.
        for player in players {
            if !self.connections.contains_key(&player) {
                if let Some(mut s) = self.sessions.get_mut(&match_id) {
                    s.set_connected(player, false, Instant::now());
                }
            }
        }

        for (player, msg) in found {
            self.send_to(player, msg);
            self.send_to(player, timer.clone());
        }
        self.spawn_clock(match_id);
    }

    fn return_to_queue(&self, pairing: Pairing, error: Option<&DuelError>) {
        for player in self.queue.requeue(pairing) {
            if let Some(e) = error {
                self.send_to(player, e.to_message());
            }
            self.send_to(
                player,
                ServerMessage::QueueJoined {
                    status: QueueStatus::Queued,
                    match_id: None,
                    warning: None,
                },
            );
        }
    }

    /// Drive the countdown and start cue for one match.
    fn spawn_clock(self: &Arc<Self>, match_id: MatchId) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = coordinator
                    .sessions
                    .get(&match_id)
                    .and_then(|s| s.current_wait(&coordinator.timing));
                let Some(wait) = wait else { break };
                tokio::time::sleep(wait).await;

                let update = coordinator.sessions.get_mut(&match_id).and_then(|mut s| {
                    if s.is_resolved() || !s.advance(Instant::now(), Utc::now()) {
                        return None;
                    }
                    Some((s.players(), s.timer_update(), s.phase))
                });
                let Some((players, msg, phase)) = update else { break };

                if phase == Phase::Active {
                    info!(match_id = %match_id, "match active");
                }
                for player in players {
                    coordinator.send_to(player, msg.clone());
                }
            }
        });
    }

    /// Free both players and store the result. Called once per match, by
    /// whoever resolved it.
    async fn complete(&self, result: MatchResult) {
        info!(
            match_id = %result.match_id,
            winner = ?result.winner_id,
            outcome = result.outcome.as_str(),
            duration_seconds = result.duration_seconds,
            "match resolved"
        );
        for player in [result.player_a, result.player_b] {
            self.queue.release(player);
        }
        self.persist(result).await;
    }

    /// Store a result, then apply ratings and tell both players. Ratings only
    /// move once the result is stored; a failed write is retried by the next
    /// maintenance pass.
    async fn persist(&self, result: MatchResult) {
        let match_id = result.match_id;
        if let Err(e) = self.collab.results.record(&result).await {
            // The write may have landed before the error surfaced.
            let stored = matches!(self.collab.results.result(match_id).await, Ok(Some(_)));
            if !stored {
                error!(match_id = %match_id, error = %e, "failed to record match result, will retry");
                if let Some(mut session) = self.sessions.get_mut(&match_id) {
                    session.mark_unrecorded();
                }
                return;
            }
        }

        if result.outcome != OutcomeKind::Abandoned {
            for player in [result.player_a, result.player_b] {
                let delta = result.delta_for(player).unwrap_or(0);
                if let Err(e) = self.collab.profiles.apply_rating_delta(player, delta).await {
                    error!(player_id = player, match_id = %match_id, error = %e, "failed to apply rating change");
                }
            }
        }

        for player in [result.player_a, result.player_b] {
            if let Some(msg) = completed_message(&result, player) {
                self.send_to(player, msg);
            }
        }
    }

    // -- Maintenance ----------------------------------------------------------

    /// Pair whatever the queue now allows and close matches whose players
    /// went quiet.
    pub async fn sweep_and_reap(self: &Arc<Self>, now: Instant) {
        for pairing in self.queue.sweep(now) {
            self.start_match(pairing).await;
        }
        self.reap(now).await;
    }

    pub async fn reap(&self, now: Instant) {
        let mut resolved = Vec::new();
        let mut unrecorded = Vec::new();
        let mut expired = Vec::new();

        for mut session in self.sessions.iter_mut() {
            if let Some(result) = session.take_unrecorded() {
                unrecorded.push(result);
                continue;
            }
            if let Some(at) = session.resolved_at() {
                if now.saturating_duration_since(at) >= self.timing.resolved_retention {
                    expired.push((session.id, session.players()));
                }
                continue;
            }
            let resolution = match session.expired(now, &self.timing).as_slice() {
                [] => continue,
                [loser] => Resolution::Forfeited { loser: *loser },
                _ => Resolution::Abandoned,
            };
            if let Ok(result) = session.resolve(resolution, now) {
                resolved.push(result);
            }
        }

        for (match_id, players) in expired {
            self.sessions.remove(&match_id);
            for player in players {
                self.player_matches.remove_if(&player, |_, m| *m == match_id);
            }
            debug!(match_id = %match_id, "resolved match dropped");
        }

        for result in resolved {
            self.complete(result).await;
        }
        for result in unrecorded {
            self.persist(result).await;
        }
    }

    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                coordinator.sweep_and_reap(Instant::now()).await;
            }
        })
    }
}
