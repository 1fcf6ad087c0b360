use std::env;
use std::str::FromStr;
use std::time::Duration;

use strum::EnumString;

use crate::rate_limit::RateLimitPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    Missing(&'static str),
    #[error("environment variable {key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CounterBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub host: String,
    pub port: u16,
    /// Role assumed for calls made on behalf of a signed-in user.
    pub user_role: String,
    /// Elevated role assumed by the voice webhook.
    pub service_role: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub log_format: LogFormat,
    pub store_backend: StoreBackend,
    pub database: DatabaseSettings,
    pub counter_backend: CounterBackend,
    pub redis_url: String,
    pub rate_limit: RateLimitPolicy,
    pub jwt_secret: String,
    pub jwt_audience: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database = DatabaseSettings {
            user: env_or("DB_USER", "postgres"),
            password: env_or("DB_PASSWORD", "postgres"),
            dbname: env_or("DB_NAME", "ledger"),
            host: env_or("DB_HOST", "localhost"),
            port: parse_or(&lookup, "DB_PORT", 5432)?,
            user_role: env_or("DB_USER_ROLE", "authenticated"),
            service_role: env_or("DB_SERVICE_ROLE", "service_role"),
        };

        let rate_limit = RateLimitPolicy {
            limit: parse_or(&lookup, "RATE_LIMIT_REQUESTS", 100)?,
            window: Duration::from_secs(parse_or(&lookup, "RATE_LIMIT_WINDOW_SECS", 60)?),
        };
        if rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_WINDOW_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Pretty)?,
            store_backend: parse_or(&lookup, "STORE_BACKEND", StoreBackend::Postgres)?,
            database,
            counter_backend: parse_or(&lookup, "COUNTER_BACKEND", CounterBackend::Redis)?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            rate_limit,
            jwt_secret: optional("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            jwt_audience: optional("JWT_AUDIENCE"),
            webhook_secret: optional("VAPI_WEBHOOK_SECRET"),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
