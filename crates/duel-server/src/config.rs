use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Phase durations and liveness windows for a match.
#[derive(Debug, Clone)]
pub struct MatchTiming {
    /// Number of countdown ticks broadcast before the start cue.
    pub countdown_ticks: u32,
    pub tick: Duration,
    /// How long the "START!" cue is shown before the clock runs.
    pub starting: Duration,
    /// Silence allowed from a player while the match is active.
    pub idle_timeout: Duration,
    /// Silence allowed from a player before the match is active.
    pub heartbeat_grace: Duration,
    /// Wait imposed after a rejected submission.
    pub submit_cooldown: Duration,
    /// How long resolved matches stay around to answer late messages.
    pub resolved_retention: Duration,
}

impl Default for MatchTiming {
    fn default() -> Self {
        Self {
            countdown_ticks: 3,
            tick: Duration::from_secs(1),
            starting: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            heartbeat_grace: Duration::from_secs(30),
            submit_cooldown: Duration::from_secs(5),
            resolved_retention: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: String,
    /// LeetCode GraphQL endpoint. Unset means dev mode: problems and
    /// solves come from in-memory sources.
    pub leetcode_url: Option<String>,
    pub max_connections: u32,
    pub sweep_interval: Duration,
    /// Maximum rating gap for pairing; unset means open pairing.
    pub rating_band: Option<i32>,
    pub timing: MatchTiming,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "sqlite:duel.db?mode=rwc".to_string(),
            leetcode_url: None,
            max_connections: 100,
            sweep_interval: Duration::from_secs(1),
            rating_band: None,
            timing: MatchTiming::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();
        let timing = MatchTiming {
            countdown_ticks: parse_or("COUNTDOWN_TICKS", defaults.timing.countdown_ticks)?,
            tick: millis_or("TICK_MS", defaults.timing.tick)?,
            starting: millis_or("STARTING_MS", defaults.timing.starting)?,
            idle_timeout: secs_or("IDLE_TIMEOUT_SECS", defaults.timing.idle_timeout)?,
            heartbeat_grace: secs_or("HEARTBEAT_GRACE_SECS", defaults.timing.heartbeat_grace)?,
            submit_cooldown: secs_or("SUBMIT_COOLDOWN_SECS", defaults.timing.submit_cooldown)?,
            resolved_retention: defaults.timing.resolved_retention,
        };

        Ok(Self {
            port: parse_or("PORT", defaults.port)?,
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            leetcode_url: env::var("LEETCODE_GRAPHQL_URL").ok().filter(|s| !s.is_empty()),
            max_connections: parse_or("MAX_CONNECTIONS", defaults.max_connections)?,
            sweep_interval: millis_or("SWEEP_INTERVAL_MS", defaults.sweep_interval)?,
            rating_band: match env::var("RATING_BAND") {
                Ok(v) => Some(parse("RATING_BAND", &v)?),
                Err(_) => None,
            },
            timing,
        })
    }

    pub fn is_dev_mode(&self) -> bool {
        self.leetcode_url.is_none()
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        var,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(v) => parse(var, &v),
        Err(_) => Ok(default),
    }
}

fn millis_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(var, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(var, default.as_secs()).map(Duration::from_secs)
}
