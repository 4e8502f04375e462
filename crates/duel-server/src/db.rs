use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use duel_core::protocol::{MatchId, MatchResult, OutcomeKind, PlayerId};
use duel_core::{Difficulty, DisallowedCatalog, TopicId};

use crate::collab::{PlayerSnapshot, ProfileStore, ResultStore, TopicCatalog};
use crate::error::DuelError;

/// Create all tables if they don't exist.
pub async fn init_db(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS players (
            id INTEGER PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            external_handle TEXT,
            rating INTEGER NOT NULL DEFAULT 1200,
            wins INTEGER NOT NULL DEFAULT 0,
            losses INTEGER NOT NULL DEFAULT 0,
            topics TEXT NOT NULL DEFAULT '[]',
            difficulties TEXT NOT NULL DEFAULT '[]',
            repeat_allowed INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS match_results (
            match_id TEXT PRIMARY KEY,
            player_a INTEGER NOT NULL,
            player_b INTEGER NOT NULL,
            winner_id INTEGER,
            loser_id INTEGER,
            outcome TEXT NOT NULL,
            elo_before_a INTEGER NOT NULL,
            elo_before_b INTEGER NOT NULL,
            elo_after_a INTEGER NOT NULL,
            elo_after_b INTEGER NOT NULL,
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            problem_slug TEXT NOT NULL,
            rating_formula TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (player_a) REFERENCES players(id),
            FOREIGN KEY (player_b) REFERENCES players(id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS topic_gaps (
            topic_id INTEGER NOT NULL,
            difficulty INTEGER NOT NULL,
            PRIMARY KEY (topic_id, difficulty)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Replace the stored (topic, difficulty) gaps.
pub async fn replace_topic_gaps(
    pool: &SqlitePool,
    catalog: &DisallowedCatalog,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM topic_gaps").execute(&mut *tx).await?;
    for (topic, gaps) in catalog {
        for difficulty in gaps {
            sqlx::query("INSERT INTO topic_gaps (topic_id, difficulty) VALUES (?1, ?2)")
                .bind(topic.0 as i64)
                .bind(difficulty.level() as i64)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await
}

pub async fn topic_gap_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM topic_gaps")
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

/// Profiles, results and topic gaps backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn player_from_row(r: &SqliteRow) -> Result<PlayerSnapshot, DuelError> {
    let topics: Vec<TopicId> = serde_json::from_str(r.get::<&str, _>("topics"))
        .map_err(|e| DuelError::ExternalService(format!("corrupt topics column: {e}")))?;
    let difficulty_levels: Vec<u8> = serde_json::from_str(r.get::<&str, _>("difficulties"))
        .map_err(|e| DuelError::ExternalService(format!("corrupt difficulties column: {e}")))?;
    Ok(PlayerSnapshot {
        id: r.get("id"),
        username: r.get("username"),
        external_handle: r.get("external_handle"),
        rating: r.get("rating"),
        topics,
        difficulty_levels,
        repeat_allowed: r.get("repeat_allowed"),
    })
}

fn result_from_row(r: &SqliteRow) -> Result<MatchResult, DuelError> {
    let match_id: String = r.get("match_id");
    let outcome: String = r.get("outcome");
    Ok(MatchResult {
        match_id: Uuid::parse_str(&match_id)
            .map_err(|e| DuelError::ExternalService(format!("corrupt match id: {e}")))?,
        player_a: r.get("player_a"),
        player_b: r.get("player_b"),
        winner_id: r.get("winner_id"),
        loser_id: r.get("loser_id"),
        outcome: OutcomeKind::parse(&outcome)
            .ok_or_else(|| DuelError::ExternalService(format!("unknown outcome {outcome}")))?,
        elo_before_a: r.get("elo_before_a"),
        elo_before_b: r.get("elo_before_b"),
        elo_after_a: r.get("elo_after_a"),
        elo_after_b: r.get("elo_after_b"),
        duration_seconds: r.get("duration_seconds"),
        problem_slug: r.get("problem_slug"),
        rating_formula: r.get("rating_formula"),
    })
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn player(&self, id: PlayerId) -> Result<Option<PlayerSnapshot>, DuelError> {
        let row = sqlx::query(
            "SELECT id, username, external_handle, rating, topics, difficulties, repeat_allowed
             FROM players WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(player_from_row).transpose()
    }

    async fn apply_rating_delta(&self, id: PlayerId, delta: i32) -> Result<i32, DuelError> {
        let row = sqlx::query(
            "UPDATE players SET rating = rating + ?1 WHERE id = ?2 RETURNING rating",
        )
        .bind(delta)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.get("rating")).ok_or(DuelError::UnknownPlayer)
    }

    async fn create_player(&self, player: &PlayerSnapshot) -> Result<(), DuelError> {
        let topics = serde_json::to_string(&player.topics)
            .map_err(|e| DuelError::Malformed(e.to_string()))?;
        let difficulties = serde_json::to_string(&player.difficulty_levels)
            .map_err(|e| DuelError::Malformed(e.to_string()))?;
        sqlx::query(
            "INSERT INTO players (id, username, external_handle, rating, topics, difficulties, repeat_allowed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(player.id)
        .bind(&player.username)
        .bind(&player.external_handle)
        .bind(player.rating)
        .bind(topics)
        .bind(difficulties)
        .bind(player.repeat_allowed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    /// Store the result and bump win/loss counters in one transaction.
    async fn record(&self, result: &MatchResult) -> Result<(), DuelError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO match_results (match_id, player_a, player_b, winner_id, loser_id, outcome,
                elo_before_a, elo_before_b, elo_after_a, elo_after_b, duration_seconds,
                problem_slug, rating_formula)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(result.match_id.to_string())
        .bind(result.player_a)
        .bind(result.player_b)
        .bind(result.winner_id)
        .bind(result.loser_id)
        .bind(result.outcome.as_str())
        .bind(result.elo_before_a)
        .bind(result.elo_before_b)
        .bind(result.elo_after_a)
        .bind(result.elo_after_b)
        .bind(result.duration_seconds)
        .bind(&result.problem_slug)
        .bind(&result.rating_formula)
        .execute(&mut *tx)
        .await?;

        if let (Some(winner), Some(loser)) = (result.winner_id, result.loser_id) {
            sqlx::query("UPDATE players SET wins = wins + 1 WHERE id = ?1")
                .bind(winner)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE players SET losses = losses + 1 WHERE id = ?1")
                .bind(loser)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn result(&self, match_id: MatchId) -> Result<Option<MatchResult>, DuelError> {
        let row = sqlx::query("SELECT * FROM match_results WHERE match_id = ?1")
            .bind(match_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn played_slugs(&self, player: PlayerId) -> Result<Vec<String>, DuelError> {
        let rows = sqlx::query(
            "SELECT DISTINCT problem_slug FROM match_results
             WHERE player_a = ?1 OR player_b = ?1",
        )
        .bind(player)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("problem_slug")).collect())
    }
}

#[async_trait]
impl TopicCatalog for SqliteStore {
    async fn disallowed_difficulties(&self) -> Result<DisallowedCatalog, DuelError> {
        let rows = sqlx::query("SELECT topic_id, difficulty FROM topic_gaps")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(DuelError::ExternalService("topic catalog has not been loaded".into()));
        }

        let mut catalog = DisallowedCatalog::new();
        for r in &rows {
            let topic = TopicId(r.get::<i64, _>("topic_id") as u16);
            if let Some(d) = Difficulty::from_level(r.get::<i64, _>("difficulty") as u8) {
                catalog.entry(topic).or_default().insert(d);
            }
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn player(id: PlayerId) -> PlayerSnapshot {
        PlayerSnapshot {
            id,
            username: format!("player{id}"),
            external_handle: Some(format!("lc_{id}")),
            rating: 1500,
            topics: vec![TopicId(0), TopicId(2)],
            difficulty_levels: vec![1, 3],
            repeat_allowed: false,
        }
    }

    #[tokio::test]
    async fn players_round_trip_and_ratings_move() {
        let store = store().await;
        store.create_player(&player(1)).await.unwrap();
        assert_eq!(store.player(1).await.unwrap(), Some(player(1)));
        assert_eq!(store.player(2).await.unwrap(), None);

        assert_eq!(store.apply_rating_delta(1, -24).await.unwrap(), 1476);
        assert_eq!(store.rating(1).await.unwrap(), 1476);
        assert!(matches!(
            store.apply_rating_delta(9, 5).await,
            Err(DuelError::UnknownPlayer)
        ));
    }

    #[tokio::test]
    async fn results_are_stored_once() {
        let store = store().await;
        store.create_player(&player(1)).await.unwrap();
        store.create_player(&player(2)).await.unwrap();

        let result = MatchResult {
            match_id: Uuid::new_v4(),
            player_a: 1,
            player_b: 2,
            winner_id: Some(1),
            loser_id: Some(2),
            outcome: OutcomeKind::Submission,
            elo_before_a: 1500,
            elo_before_b: 1500,
            elo_after_a: 1516,
            elo_after_b: 1484,
            duration_seconds: 321,
            problem_slug: "two-sum".into(),
            rating_formula: "elo-k32-v1".into(),
        };
        store.record(&result).await.unwrap();
        assert!(store.record(&result).await.is_err());

        assert_eq!(store.result(result.match_id).await.unwrap(), Some(result));
        assert_eq!(store.played_slugs(2).await.unwrap(), vec!["two-sum"]);

        let row = sqlx::query("SELECT wins FROM players WHERE id = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("wins"), 1);
    }

    #[tokio::test]
    async fn empty_catalog_fails_closed() {
        let store = store().await;
        assert!(store.disallowed_difficulties().await.is_err());

        let mut catalog = DisallowedCatalog::new();
        catalog.insert(TopicId(4), [Difficulty::Easy, Difficulty::Hard].into());
        replace_topic_gaps(store.pool(), &catalog).await.unwrap();
        assert_eq!(topic_gap_count(store.pool()).await.unwrap(), 2);
        assert_eq!(store.disallowed_difficulties().await.unwrap(), catalog);
    }
}
