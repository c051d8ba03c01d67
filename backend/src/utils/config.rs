use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::*;
use crate::db::DatabaseConfig;
use crate::engine::{EngineConfig, RevealRule, WorkerConfig};
use crate::utils::backoff::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Single-node development only; state dies with the process.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("STORE_BACKEND must be 'postgres' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// Present whenever the backend is Postgres.
    pub database: Option<DatabaseConfig>,
    pub port: u16,
    pub process_id: Uuid,
    pub engine: EngineConfig,
    pub workers: WorkerConfig,
    pub chat_service_url: Option<String>,
    pub push_service_url: Option<String>,
    pub analytics_url: Option<String>,
    pub allowed_origins: Vec<String>,
}

/// Reads `key`, falling back to `default` when unset or unparsable.
fn parsed_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + ToString,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_backend = match non_empty(&lookup, "STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Postgres,
        };

        let database = match store_backend {
            StoreBackend::Postgres => Some(DatabaseConfig {
                database_url: non_empty(&lookup, "DATABASE_URL")
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?,
                max_connections: parsed_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            }),
            StoreBackend::Memory => None,
        };

        let process_id = match non_empty(&lookup, "PROCESS_ID") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("PROCESS_ID must be a UUID"))?,
            None => Uuid::new_v4(),
        };

        let reveal_rule = match non_empty(&lookup, "REVEAL_POLICY") {
            Some(raw) => raw
                .parse::<RevealRule>()
                .map_err(|e| anyhow::anyhow!("REVEAL_POLICY: {}", e))?,
            None => RevealRule::default(),
        };

        let engine = EngineConfig {
            proposal_timeout: ChronoDuration::seconds(parsed_or(
                &lookup,
                "PROPOSAL_TIMEOUT_SECS",
                DEFAULT_PROPOSAL_TIMEOUT_SECS,
            )),
            min_score: parsed_or(&lookup, "MIN_COMPATIBILITY_SCORE", DEFAULT_MIN_COMPATIBILITY_SCORE),
            max_candidates: parsed_or(&lookup, "MAX_CANDIDATES", DEFAULT_MAX_CANDIDATES),
            grid_cell_degrees: parsed_or(&lookup, "GRID_CELL_DEGREES", DEFAULT_GRID_CELL_DEGREES),
            max_radius_km: parsed_or(&lookup, "MAX_SEARCH_RADIUS_KM", MAX_SEARCH_RADIUS_KM),
            inactive_days: parsed_or(&lookup, "INACTIVE_DAYS", DEFAULT_INACTIVE_DAYS),
            reveal_rule,
            chat_retry: RetryPolicy::default(),
            disconnected_grace: ChronoDuration::seconds(parsed_or(
                &lookup,
                "DISCONNECTED_GRACE_SECS",
                DISCONNECTED_GRACE_SECS,
            )),
            stale_process_after: ChronoDuration::seconds(parsed_or(&lookup, "STALE_PROCESS_SECS", STALE_PROCESS_SECS)),
        };
        if engine.grid_cell_degrees <= 0.0 || engine.proposal_timeout <= ChronoDuration::zero() {
            return Err(anyhow::anyhow!(
                "GRID_CELL_DEGREES and PROPOSAL_TIMEOUT_SECS must be positive"
            ));
        }

        let secs = |key: &str, default: u64| Duration::from_secs(parsed_or(&lookup, key, default).max(1));
        let workers = WorkerConfig {
            expiry_interval: secs("EXPIRY_SWEEP_INTERVAL_SECS", EXPIRY_SWEEP_INTERVAL_SECS),
            matching_interval: secs("MATCHING_INTERVAL_SECS", MATCHING_INTERVAL_SECS),
            chat_retry_interval: secs("CHAT_RETRY_INTERVAL_SECS", CHAT_RETRY_INTERVAL_SECS),
            reveal_interval: secs("REVEAL_TICK_INTERVAL_SECS", REVEAL_TICK_INTERVAL_SECS),
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", HEARTBEAT_INTERVAL_SECS),
            metrics_interval: secs("METRICS_REFRESH_INTERVAL_SECS", METRICS_REFRESH_INTERVAL_SECS),
            run_matching_rounds: parsed_or(&lookup, "RUN_MATCHING_ROUNDS", true),
        };

        let allowed_origins = non_empty(&lookup, "ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            store_backend,
            database,
            port: parsed_or(&lookup, "PORT", DEFAULT_SERVER_PORT),
            process_id,
            engine,
            workers,
            chat_service_url: non_empty(&lookup, "CHAT_SERVICE_URL"),
            push_service_url: non_empty(&lookup, "PUSH_SERVICE_URL"),
            analytics_url: non_empty(&lookup, "ANALYTICS_URL"),
            allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL must be set"));

        let config = config_from(&[("DATABASE_URL", "postgres://localhost/mm")]).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.database.unwrap().max_connections, DEFAULT_DB_MAX_CONNECTIONS);
    }

    #[test]
    fn test_memory_backend_uses_defaults() {
        let config = config_from(&[("STORE_BACKEND", "memory")]).unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.engine.proposal_timeout, ChronoDuration::seconds(DEFAULT_PROPOSAL_TIMEOUT_SECS));
        assert_eq!(config.engine.reveal_rule, RevealRule::MutualRequest);
        assert!(config.workers.run_matching_rounds);
        assert!(config.chat_service_url.is_none());
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = config_from(&[
            ("STORE_BACKEND", "memory"),
            ("PORT", "8080"),
            ("PROPOSAL_TIMEOUT_SECS", "30"),
            ("MIN_COMPATIBILITY_SCORE", "20"),
            ("REVEAL_POLICY", "any:mutual,messages:10"),
            ("RUN_MATCHING_ROUNDS", "false"),
            ("CHAT_SERVICE_URL", "http://chat.internal"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.engine.proposal_timeout, ChronoDuration::seconds(30));
        assert_eq!(config.engine.min_score, 20);
        assert_eq!(
            config.engine.reveal_rule,
            RevealRule::AnyOf(vec![RevealRule::MutualRequest, RevealRule::MessageCount(10)])
        );
        assert!(!config.workers.run_matching_rounds);
        assert_eq!(config.chat_service_url.as_deref(), Some("http://chat.internal"));
        assert_eq!(config.allowed_origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_bad_values_fall_back_or_fail() {
        // Unparsable numbers fall back to the default
        let config = config_from(&[("STORE_BACKEND", "memory"), ("PORT", "not-a-port")]).unwrap();
        assert_eq!(config.port, DEFAULT_SERVER_PORT);

        assert!(config_from(&[("STORE_BACKEND", "redis")]).is_err());
        assert!(config_from(&[("STORE_BACKEND", "memory"), ("REVEAL_POLICY", "telepathy")]).is_err());
        assert!(config_from(&[("STORE_BACKEND", "memory"), ("PROCESS_ID", "pid-7")]).is_err());
    }
}
