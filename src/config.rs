//! Process configuration, read once from the environment at startup.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub(crate) const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_PARTICIPANT_QUEUE_CAPACITY: usize = 256;
pub(crate) const DEFAULT_REGISTRY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    /// Fixed delay between autosave flushes of a live session.
    pub autosave_interval: Duration,
    /// Outbound messages buffered per participant before deliveries drop.
    pub participant_queue_capacity: usize,
    /// Pending admit/remove/broadcast commands buffered for the registry loop.
    pub registry_queue_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        Ok(Self {
            database_url,
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            autosave_interval: Duration::from_secs(
                env_parse("AUTOSAVE_INTERVAL_SECS", DEFAULT_AUTOSAVE_INTERVAL_SECS).max(1),
            ),
            participant_queue_capacity: env_parse("PARTICIPANT_QUEUE_CAPACITY", DEFAULT_PARTICIPANT_QUEUE_CAPACITY)
                .max(1),
            registry_queue_capacity: env_parse("REGISTRY_QUEUE_CAPACITY", DEFAULT_REGISTRY_QUEUE_CAPACITY).max(1),
        })
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// unset or unparsable.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
