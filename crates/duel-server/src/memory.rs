//! In-process collaborators for dev mode and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use duel_core::filter::catalog_from_coverage;
use duel_core::protocol::{MatchId, MatchResult, PlayerId, Problem};
use duel_core::topic::topic_by_name;
use duel_core::{Difficulty, DisallowedCatalog};

use crate::collab::{
    AcceptedSolve, Collaborators, PlayerSnapshot, ProblemFilter, ProblemSource, ProfileStore,
    ResultStore, SubmissionOracle, TopicCatalog,
};
use crate::error::DuelError;

pub struct InMemoryProblemSource {
    problems: Vec<Problem>,
}

impl InMemoryProblemSource {
    pub fn new(problems: Vec<Problem>) -> Self {
        Self { problems }
    }

    /// A small fixed problem set covering every difficulty.
    pub fn sample() -> Self {
        Self::new(sample_problems())
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    fn matches(problem: &Problem, filter: &ProblemFilter) -> bool {
        let difficulty_ok =
            filter.difficulties.is_empty() || filter.difficulties.contains(&problem.difficulty);
        let topic_ok = filter.topics.is_empty()
            || problem
                .tags
                .iter()
                .filter_map(|t| topic_by_name(t))
                .any(|t| filter.topics.contains(&t));
        difficulty_ok && topic_ok && !filter.exclude_slugs.contains(&problem.slug)
    }
}

#[async_trait]
impl ProblemSource for InMemoryProblemSource {
    async fn random_problem(&self, filter: &ProblemFilter) -> Result<Problem, DuelError> {
        let candidates: Vec<&Problem> = self
            .problems
            .iter()
            .filter(|p| Self::matches(p, filter))
            .collect();
        if candidates.is_empty() {
            return Err(DuelError::ExternalService(
                "no problem matches the selected topics and difficulties".into(),
            ));
        }
        let idx = {
            use rand::RngExt;
            rand::rng().random_range(0..candidates.len())
        };
        Ok(candidates[idx].clone())
    }
}

#[derive(Default)]
pub struct InMemorySubmissionOracle {
    solves: DashMap<String, AcceptedSolve>,
    unavailable: AtomicBool,
}

impl InMemorySubmissionOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_solve(&self, handle: &str, problem_slug: &str, solved_at: DateTime<Utc>) {
        self.solves.insert(
            handle.to_string(),
            AcceptedSolve {
                problem_slug: problem_slug.to_string(),
                solved_at,
            },
        );
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }
}

#[async_trait]
impl SubmissionOracle for InMemorySubmissionOracle {
    async fn most_recent_accepted(
        &self,
        handle: &str,
    ) -> Result<Option<AcceptedSolve>, DuelError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(DuelError::ExternalService("submission oracle offline".into()));
        }
        Ok(self.solves.get(handle).map(|s| s.clone()))
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    players: DashMap<PlayerId, PlayerSnapshot>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, player: PlayerSnapshot) {
        self.players.insert(player.id, player);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn player(&self, id: PlayerId) -> Result<Option<PlayerSnapshot>, DuelError> {
        Ok(self.players.get(&id).map(|p| p.clone()))
    }

    async fn apply_rating_delta(&self, id: PlayerId, delta: i32) -> Result<i32, DuelError> {
        let mut player = self.players.get_mut(&id).ok_or(DuelError::UnknownPlayer)?;
        player.rating += delta;
        Ok(player.rating)
    }

    async fn create_player(&self, player: &PlayerSnapshot) -> Result<(), DuelError> {
        self.players.entry(player.id).or_insert_with(|| player.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    catalog: RwLock<Option<DisallowedCatalog>>,
}

impl InMemoryCatalog {
    pub fn new(catalog: DisallowedCatalog) -> Self {
        Self {
            catalog: RwLock::new(Some(catalog)),
        }
    }

    pub fn from_problems(problems: &[Problem]) -> Self {
        Self::new(catalog_for(problems))
    }

    /// Simulate the catalog being unreachable.
    pub fn set_unavailable(&self) {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl TopicCatalog for InMemoryCatalog {
    async fn disallowed_difficulties(&self) -> Result<DisallowedCatalog, DuelError> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DuelError::ExternalService("topic catalog unavailable".into()))
    }
}

#[derive(Default)]
pub struct InMemoryResultStore {
    results: Mutex<Vec<MatchResult>>,
    unavailable: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail until switched back on. Reads keep working.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    pub fn all(&self) -> Vec<MatchResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn record(&self, result: &MatchResult) -> Result<(), DuelError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(DuelError::ExternalService("result store unavailable".into()));
        }
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if results.iter().any(|r| r.match_id == result.match_id) {
            return Err(DuelError::ExternalService(format!(
                "result for match {} already recorded",
                result.match_id
            )));
        }
        results.push(result.clone());
        Ok(())
    }

    async fn result(&self, match_id: MatchId) -> Result<Option<MatchResult>, DuelError> {
        Ok(self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.match_id == match_id)
            .cloned())
    }

    async fn played_slugs(&self, player: PlayerId) -> Result<Vec<String>, DuelError> {
        Ok(self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.player_a == player || r.player_b == player)
            .map(|r| r.problem_slug.clone())
            .collect())
    }
}

/// Every collaborator in memory, with handles kept for seeding and
/// inspection.
#[derive(Clone)]
pub struct InMemoryBackend {
    pub problems: Arc<InMemoryProblemSource>,
    pub oracle: Arc<InMemorySubmissionOracle>,
    pub profiles: Arc<InMemoryProfileStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub results: Arc<InMemoryResultStore>,
}

impl InMemoryBackend {
    pub fn sample() -> Self {
        let problems = InMemoryProblemSource::sample();
        let catalog = InMemoryCatalog::from_problems(problems.problems());
        Self {
            problems: Arc::new(problems),
            oracle: Arc::new(InMemorySubmissionOracle::new()),
            profiles: Arc::new(InMemoryProfileStore::new()),
            catalog: Arc::new(catalog),
            results: Arc::new(InMemoryResultStore::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            problems: self.problems.clone(),
            oracle: self.oracle.clone(),
            profiles: self.profiles.clone(),
            catalog: self.catalog.clone(),
            results: self.results.clone(),
        }
    }
}

/// Gaps of a problem set: a (topic, difficulty) pair is disallowed when no
/// problem in the set carries both.
pub fn catalog_for(problems: &[Problem]) -> DisallowedCatalog {
    catalog_from_coverage(problems.iter().flat_map(|p| {
        p.tags
            .iter()
            .filter_map(|t| topic_by_name(t))
            .map(move |t| (t, p.difficulty))
    }))
}

fn problem(id: i64, title: &str, slug: &str, difficulty: Difficulty, tags: &[&str]) -> Problem {
    Problem {
        id,
        title: title.to_string(),
        slug: slug.to_string(),
        difficulty,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn sample_problems() -> Vec<Problem> {
    use Difficulty::*;
    vec![
        problem(1, "Two Sum", "two-sum", Easy, &["Array", "Hash Table"]),
        problem(20, "Valid Parentheses", "valid-parentheses", Easy, &["String", "Stack"]),
        problem(121, "Best Time to Buy and Sell Stock", "best-time-to-buy-and-sell-stock", Easy, &["Array", "Dynamic Programming"]),
        problem(704, "Binary Search", "binary-search", Easy, &["Array", "Binary Search"]),
        problem(3, "Longest Substring Without Repeating Characters", "longest-substring-without-repeating-characters", Medium, &["Hash Table", "String", "Sliding Window"]),
        problem(200, "Number of Islands", "number-of-islands", Medium, &["Array", "Depth-First Search", "Breadth-First Search", "Union Find", "Matrix"]),
        problem(322, "Coin Change", "coin-change", Medium, &["Array", "Dynamic Programming", "Breadth-First Search"]),
        problem(207, "Course Schedule", "course-schedule", Medium, &["Depth-First Search", "Breadth-First Search", "Graph", "Topological Sort"]),
        problem(4, "Median of Two Sorted Arrays", "median-of-two-sorted-arrays", Hard, &["Array", "Binary Search", "Divide and Conquer"]),
        problem(23, "Merge k Sorted Lists", "merge-k-sorted-lists", Hard, &["Linked List", "Divide and Conquer", "Heap (Priority Queue)", "Merge Sort"]),
        problem(42, "Trapping Rain Water", "trapping-rain-water", Hard, &["Array", "Two Pointers", "Dynamic Programming", "Stack", "Monotonic Stack"]),
        problem(212, "Word Search II", "word-search-ii", Hard, &["Array", "String", "Backtracking", "Trie", "Matrix"]),
    ]
}
