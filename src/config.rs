use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run_address: String,
    /// When unset the service runs on the in-memory store.
    pub database_uri: Option<String>,
    pub accrual_address: String,
    pub accrual_poll_interval_secs: u64,
    pub accrual_workers: usize,
    pub accrual_retry_attempts: u32,
    pub accrual_retry_wait_secs: u64,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub auth_rate_limit: u32,
    pub auth_rate_limit_period_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            run_address: std::env::var("RUN_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_uri: std::env::var("DATABASE_URI").ok(),
            accrual_address: std::env::var("ACCRUAL_SYSTEM_ADDRESS")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            accrual_poll_interval_secs: env_parse("ACCRUAL_POLL_INTERVAL", 10)?,
            accrual_workers: env_parse("ACCRUAL_WORKERS", 1)?,
            accrual_retry_attempts: env_parse("ACCRUAL_RETRY_ATTEMPTS", 3)?,
            accrual_retry_wait_secs: env_parse("ACCRUAL_RETRY_WAIT", 1)?,
            jwt_secret: std::env::var("JWT_SECRET_KEY")
                .unwrap_or_else(|_| "secretkey".to_string()),
            token_ttl_hours: env_parse("TOKEN_TTL_HOURS", 24)?,
            auth_rate_limit: env_parse_nonzero("AUTH_RATE_LIMIT", 10)?,
            auth_rate_limit_period_secs: env_parse_nonzero("AUTH_RATE_LIMIT_PERIOD", 60)?,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, config::ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| config::ConfigError::Message(format!("invalid {name}: {err}"))),
        Err(_) => Ok(default),
    }
}

/// The rate-limit knobs feed `Quota`/`NonZeroU32` constructors, so zero must
/// be rejected here rather than panic at limiter construction.
fn env_parse_nonzero<T>(name: &str, default: T) -> Result<T, config::ConfigError>
where
    T: FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
{
    let value = env_parse(name, default)?;

    if value < T::from(1) {
        return Err(config::ConfigError::Message(format!(
            "{name} must be at least 1"
        )));
    }

    Ok(value)
}
