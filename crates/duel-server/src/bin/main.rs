use std::error::Error;
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use duel_server::collab::Collaborators;
use duel_server::config::ServerConfig;
use duel_server::db::{self, SqliteStore};
use duel_server::leetcode::LeetCodeClient;
use duel_server::memory::{self, InMemoryProblemSource, InMemorySubmissionOracle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duel_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    db::init_db(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));

    let collab = match &config.leetcode_url {
        Some(url) => {
            let client = Arc::new(LeetCodeClient::new(url.as_str())?);
            match client.topic_catalog().await {
                Ok(catalog) => {
                    db::replace_topic_gaps(&pool, &catalog).await?;
                    info!(topics_with_gaps = catalog.len(), "topic catalog refreshed");
                }
                Err(e) => warn!(error = %e, "could not refresh topic catalog, keeping stored copy"),
            }
            Collaborators {
                problems: client.clone(),
                oracle: client,
                profiles: store.clone(),
                catalog: store.clone(),
                results: store,
            }
        }
        None => {
            warn!("LEETCODE_GRAPHQL_URL not set, running in dev mode with sample problems");
            let problems = InMemoryProblemSource::sample();
            if db::topic_gap_count(&pool).await? == 0 {
                db::replace_topic_gaps(&pool, &memory::catalog_for(problems.problems())).await?;
                info!("seeded topic catalog from sample problems");
            }
            Collaborators {
                problems: Arc::new(problems),
                oracle: Arc::new(InMemorySubmissionOracle::new()),
                profiles: store.clone(),
                catalog: store.clone(),
                results: store,
            }
        }
    };

    let (app, _state) = duel_server::build_app(&config, collab);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, dev_mode = config.is_dev_mode(), "duel server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
