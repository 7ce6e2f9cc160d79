use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::connection::{AuthToken, ReconnectPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub stream_url: String,
    pub rest_base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub auth_token: Option<AuthToken>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let stream_url = lookup("STREAM_URL")
            .unwrap_or_else(|| "ws://127.0.0.1:8000/ws".to_string())
            .trim()
            .to_string();

        let rest_base_url = lookup("REST_BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let request_timeout_ms = parse_or(&lookup, "REQUEST_TIMEOUT_MS", 10_000)?;
        let connect_timeout_ms = parse_or(&lookup, "CONNECT_TIMEOUT_MS", 10_000)?;
        let reconnect_initial_delay_ms = parse_or(&lookup, "RECONNECT_INITIAL_DELAY_MS", 500)?;
        let reconnect_max_delay_ms = parse_or(&lookup, "RECONNECT_MAX_DELAY_MS", 15_000)?;

        let reconnect_max_attempts = match parse_or::<u32>(&lookup, "RECONNECT_MAX_ATTEMPTS", 0)? {
            0 => None,
            attempts => Some(attempts),
        };

        let auth_token = lookup("AUTH_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(AuthToken::from);

        if stream_url.is_empty() {
            bail!("STREAM_URL cannot be empty");
        }
        if reconnect_max_delay_ms < reconnect_initial_delay_ms {
            bail!(
                "RECONNECT_MAX_DELAY_MS ({reconnect_max_delay_ms}) must not be below RECONNECT_INITIAL_DELAY_MS ({reconnect_initial_delay_ms})"
            );
        }

        Ok(Self {
            stream_url,
            rest_base_url,
            request_timeout_ms,
            connect_timeout_ms,
            reconnect_initial_delay_ms,
            reconnect_max_delay_ms,
            reconnect_max_attempts,
            auth_token,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {name} value: {value}")),
        None => Ok(default),
    }
}
