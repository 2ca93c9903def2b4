//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::gateway::GatewayConfig;
use crate::ingest::IngestConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub anthropic_api_key: Option<SecretString>,
    pub analyzer_model: String,
    pub prompts_file: Option<PathBuf>,
    pub documents_dir: PathBuf,
    pub feed_spool_dir: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub http_addr: SocketAddr,

    pub poll_interval: Duration,
    pub poll_window: chrono::Duration,
    pub poll_max_items: usize,
    pub ledger_retention: chrono::Duration,
    pub maintenance_interval: Duration,

    pub workers: usize,
    pub phase_deadline: Duration,
    pub phase_max_attempts: u32,
    pub result_ttl: chrono::Duration,

    pub heartbeat: Duration,
    pub subscriber_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            analyzer_model: std::env::var("ANALYZER_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            prompts_file: std::env::var("PROMPTS_FILE").ok().map(PathBuf::from),
            documents_dir: PathBuf::from(
                std::env::var("DOCUMENTS_DIR").unwrap_or_else(|_| "./documents".to_string()),
            ),
            feed_spool_dir: PathBuf::from(
                std::env::var("FEED_SPOOL_DIR").unwrap_or_else(|_| "./spool".to_string()),
            ),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            http_addr: parsed_var("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,

            poll_interval: Duration::from_secs(parsed_var("POLL_INTERVAL_SECS", 300)?),
            poll_window: chrono::Duration::hours(parsed_var("POLL_WINDOW_HOURS", 24)?),
            poll_max_items: parsed_var("POLL_MAX_ITEMS", 50)?,
            ledger_retention: chrono::Duration::days(parsed_var("LEDGER_RETENTION_DAYS", 30)?),
            maintenance_interval: Duration::from_secs(parsed_var(
                "MAINTENANCE_INTERVAL_SECS",
                3600,
            )?),

            workers: parsed_var("WORKERS", 4)?,
            phase_deadline: Duration::from_secs(parsed_var("PHASE_DEADLINE_SECS", 120)?),
            phase_max_attempts: parsed_var("PHASE_MAX_ATTEMPTS", 2)?,
            result_ttl: chrono::Duration::days(parsed_var("RESULT_TTL_DAYS", 7)?),

            heartbeat: Duration::from_secs(parsed_var("HEARTBEAT_SECS", 15)?),
            subscriber_buffer: parsed_var("SUBSCRIBER_BUFFER", 64)?,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.workers.max(1),
            phase_deadline: self.phase_deadline,
            phase_max_attempts: self.phase_max_attempts.max(1),
            result_ttl: self.result_ttl,
            ..OrchestratorConfig::default()
        }
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            poll_interval: self.poll_interval,
            window: self.poll_window,
            max_items: self.poll_max_items,
            retention: self.ledger_retention,
            maintenance_interval: self.maintenance_interval,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat: self.heartbeat,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
