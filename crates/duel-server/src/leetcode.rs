//! LeetCode GraphQL client: problem source and submission oracle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use duel_core::filter::catalog_from_coverage;
use duel_core::protocol::Problem;
use duel_core::topic::topic_by_name;
use duel_core::{Difficulty, DisallowedCatalog, TopicId};

use crate::collab::{AcceptedSolve, ProblemFilter, ProblemSource, SubmissionOracle};
use crate::error::DuelError;

pub const DEFAULT_ENDPOINT: &str = "https://leetcode.com/graphql";

/// Random draws tried before giving up on a filter.
const MAX_ATTEMPTS: usize = 3;

const RANDOM_QUESTION_QUERY: &str = r#"
query randomQuestion($categorySlug: String, $filters: QuestionListFilterInput) {
  randomQuestion(categorySlug: $categorySlug, filters: $filters) {
    titleSlug
  }
}
"#;

const QUESTION_QUERY: &str = r#"
query selectProblem($titleSlug: String!) {
  question(titleSlug: $titleSlug) {
    questionId
    title
    titleSlug
    difficulty
    isPaidOnly
    topicTags { name }
  }
}
"#;

const RECENT_AC_QUERY: &str = r#"
query recentAcSubmissions($username: String!, $limit: Int) {
  recentAcSubmissionList(username: $username, limit: $limit) {
    titleSlug
    timestamp
  }
}
"#;

const COVERAGE_QUERY: &str = r#"
query problemsetQuestionListV2 {
  problemsetQuestionListV2 {
    questions {
      difficulty
      topicTags { name }
    }
  }
}
"#;

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RandomQuestionData {
    random_question: Option<SlugOnly>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlugOnly {
    title_slug: String,
}

#[derive(Deserialize)]
struct QuestionData {
    question: Option<Question>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Question {
    question_id: String,
    title: String,
    title_slug: String,
    difficulty: String,
    #[serde(default)]
    is_paid_only: bool,
    #[serde(default)]
    topic_tags: Vec<TagName>,
}

#[derive(Deserialize)]
struct TagName {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentAcData {
    #[serde(default)]
    recent_ac_submission_list: Vec<RecentAc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentAc {
    title_slug: String,
    /// Unix seconds, sent as a string.
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverageData {
    problemset_question_list_v2: CoverageList,
}

#[derive(Deserialize)]
struct CoverageList {
    #[serde(default)]
    questions: Vec<CoverageQuestion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverageQuestion {
    difficulty: String,
    #[serde(default)]
    topic_tags: Vec<TagName>,
}

pub struct LeetCodeClient {
    http: reqwest::Client,
    endpoint: String,
}

impl LeetCodeClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DuelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(external)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    async fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, DuelError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Referer", "https://leetcode.com")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(external)?
            .error_for_status()
            .map_err(external)?;

        let body: GraphQlResponse<T> = resp.json().await.map_err(external)?;
        if let Some(err) = body.errors.first() {
            return Err(DuelError::ExternalService(err.message.clone()));
        }
        body.data
            .ok_or_else(|| DuelError::ExternalService("empty GraphQL response".into()))
    }

    /// Download the whole problem set and derive which (topic, difficulty)
    /// pairs have no problems.
    pub async fn topic_catalog(&self) -> Result<DisallowedCatalog, DuelError> {
        let data: CoverageData = self.query(COVERAGE_QUERY, json!({})).await?;
        let questions = data.problemset_question_list_v2.questions;
        if questions.is_empty() {
            return Err(DuelError::ExternalService("problem set came back empty".into()));
        }
        Ok(catalog_from_coverage(questions.iter().flat_map(|q| {
            let difficulty = parse_difficulty(&q.difficulty);
            q.topic_tags
                .iter()
                .filter_map(move |t| Some((topic_by_name(&t.name)?, difficulty?)))
        })))
    }

    async fn random_slug(
        &self,
        topic: Option<TopicId>,
        difficulty: Option<Difficulty>,
    ) -> Result<Option<String>, DuelError> {
        let mut filters = serde_json::Map::new();
        if let Some(d) = difficulty {
            filters.insert("difficulty".into(), json!(d));
        }
        if let Some(name) = topic.and_then(|t| t.name()) {
            filters.insert("tags".into(), json!([tag_slug(name)]));
        }
        let data: RandomQuestionData = self
            .query(
                RANDOM_QUESTION_QUERY,
                json!({ "categorySlug": "algorithms", "filters": filters }),
            )
            .await?;
        Ok(data.random_question.map(|q| q.title_slug))
    }

    async fn question(&self, slug: &str) -> Result<Option<Question>, DuelError> {
        let data: QuestionData = self
            .query(QUESTION_QUERY, json!({ "titleSlug": slug }))
            .await?;
        Ok(data.question)
    }
}

#[async_trait]
impl ProblemSource for LeetCodeClient {
    async fn random_problem(&self, filter: &ProblemFilter) -> Result<Problem, DuelError> {
        for attempt in 0..MAX_ATTEMPTS {
            let (topic, difficulty) = pick(filter);
            let Some(slug) = self.random_slug(topic, difficulty).await? else {
                continue;
            };
            if filter.exclude_slugs.contains(&slug) {
                debug!(slug = %slug, attempt, "drew an excluded problem, retrying");
                continue;
            }
            let Some(question) = self.question(&slug).await? else {
                continue;
            };
            if question.is_paid_only {
                continue;
            }
            match to_problem(question) {
                Some(problem) => return Ok(problem),
                None => warn!(slug = %slug, "unparseable question, retrying"),
            }
        }
        Err(DuelError::ExternalService(
            "no problem found for the selected topics and difficulties".into(),
        ))
    }
}

#[async_trait]
impl SubmissionOracle for LeetCodeClient {
    async fn most_recent_accepted(
        &self,
        handle: &str,
    ) -> Result<Option<AcceptedSolve>, DuelError> {
        let data: RecentAcData = self
            .query(RECENT_AC_QUERY, json!({ "username": handle, "limit": 1 }))
            .await?;
        let Some(latest) = data.recent_ac_submission_list.into_iter().next() else {
            return Ok(None);
        };
        let solved_at = latest
            .timestamp
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| {
                DuelError::ExternalService(format!("bad submission timestamp {}", latest.timestamp))
            })?;
        Ok(Some(AcceptedSolve {
            problem_slug: latest.title_slug,
            solved_at,
        }))
    }
}

fn external(e: reqwest::Error) -> DuelError {
    DuelError::ExternalService(e.to_string())
}

fn pick(filter: &ProblemFilter) -> (Option<TopicId>, Option<Difficulty>) {
    use rand::RngExt;
    let mut rng = rand::rng();
    let topic = (!filter.topics.is_empty())
        .then(|| filter.topics[rng.random_range(0..filter.topics.len())]);
    let difficulty = (!filter.difficulties.is_empty())
        .then(|| filter.difficulties[rng.random_range(0..filter.difficulties.len())]);
    (topic, difficulty)
}

fn parse_difficulty(raw: &str) -> Option<Difficulty> {
    match raw.to_ascii_uppercase().as_str() {
        "EASY" => Some(Difficulty::Easy),
        "MEDIUM" => Some(Difficulty::Medium),
        "HARD" => Some(Difficulty::Hard),
        _ => None,
    }
}

fn to_problem(q: Question) -> Option<Problem> {
    let difficulty = parse_difficulty(&q.difficulty)?;
    Some(Problem {
        id: q.question_id.parse().ok()?,
        title: q.title,
        slug: q.title_slug,
        difficulty,
        tags: q.topic_tags.into_iter().map(|t| t.name).collect(),
    })
}

/// LeetCode's tag slug for a topic name, e.g. "Heap (Priority Queue)" ->
/// "heap-priority-queue".
pub fn tag_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_slugs() {
        assert_eq!(tag_slug("Array"), "array");
        assert_eq!(tag_slug("Heap (Priority Queue)"), "heap-priority-queue");
        assert_eq!(tag_slug("Depth-First Search"), "depth-first-search");
    }

    #[test]
    fn question_converts_to_problem() {
        let raw = r#"{
            "questionId": "1",
            "title": "Two Sum",
            "titleSlug": "two-sum",
            "difficulty": "Easy",
            "isPaidOnly": false,
            "topicTags": [{"name": "Array"}, {"name": "Hash Table"}]
        }"#;
        let q: Question = serde_json::from_str(raw).unwrap();
        let p = to_problem(q).unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(p.difficulty, Difficulty::Easy);
        assert_eq!(p.tags, vec!["Array", "Hash Table"]);
    }

    #[test]
    fn graphql_errors_are_surfaced() {
        let raw = r#"{"data": null, "errors": [{"message": "user does not exist"}]}"#;
        let body: GraphQlResponse<RecentAcData> = serde_json::from_str(raw).unwrap();
        assert!(body.data.is_none());
        assert_eq!(body.errors[0].message, "user does not exist");
    }

    #[test]
    fn coverage_response_parses() {
        let raw = r#"{"problemsetQuestionListV2": {"questions": [
            {"difficulty": "EASY", "topicTags": [{"name": "Array"}]},
            {"difficulty": "HARD", "topicTags": [{"name": "Array"}, {"name": "Not A Topic"}]}
        ]}}"#;
        let data: CoverageData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.problemset_question_list_v2.questions.len(), 2);
        assert_eq!(parse_difficulty("Medium"), Some(Difficulty::Medium));
        assert_eq!(parse_difficulty("?"), None);
    }

    #[test]
    fn pick_stays_inside_filter() {
        let filter = ProblemFilter {
            topics: vec![TopicId(3), TopicId(5)],
            difficulties: vec![Difficulty::Hard],
            exclude_slugs: vec![],
        };
        for _ in 0..20 {
            let (t, d) = pick(&filter);
            assert!(matches!(t, Some(TopicId(3)) | Some(TopicId(5))));
            assert_eq!(d, Some(Difficulty::Hard));
        }
        assert_eq!(pick(&ProblemFilter::default()), (None, None));
    }
}
