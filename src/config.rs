// src/config.rs
use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Poll creations and updates per user per minute.
    pub polls_per_minute: u32,
    pub votes_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            polls_per_minute: 5,
            votes_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub storage_timeout: Duration,
    pub results_cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub vote_purge_after: chrono::Duration,
    pub rate_limits: RateLimits,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let storage_timeout = Duration::from_secs(positive(
            "STORAGE_TIMEOUT_SECS",
            load(&lookup, "STORAGE_TIMEOUT_SECS", 5)?,
        )?);

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: load(&lookup, "PORT", 3030)?,
            database: DatabaseConfig {
                url: database_url,
                max_connections: load(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
                acquire_timeout: storage_timeout,
            },
            storage_timeout,
            results_cache_ttl: Duration::from_secs(load(&lookup, "RESULTS_CACHE_TTL_SECS", 30)?),
            sweep_interval: Duration::from_secs(positive(
                "SWEEP_INTERVAL_SECS",
                load(&lookup, "SWEEP_INTERVAL_SECS", 3600)?,
            )?),
            vote_purge_after: days(
                "VOTE_PURGE_AFTER_DAYS",
                positive("VOTE_PURGE_AFTER_DAYS", load(&lookup, "VOTE_PURGE_AFTER_DAYS", 365)?)?,
            )?,
            rate_limits: RateLimits {
                polls_per_minute: load(&lookup, "POLL_RATE_LIMIT", 5)?,
                votes_per_minute: load(&lookup, "VOTE_RATE_LIMIT", 10)?,
            },
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "HOST",
                reason: e.to_string(),
            })
    }
}

fn load<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn days(key: &'static str, value: u64) -> Result<chrono::Duration, ConfigError> {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_days)
        .ok_or_else(|| ConfigError::Invalid {
            key,
            reason: format!("{value} days is out of range"),
        })
}
