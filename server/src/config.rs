//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Connection settings for the remote relational store.
#[derive(Clone)]
pub struct RemoteConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Credential presented on connect
    pub credential: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Remote store settings; `None` runs cache-only
    pub remote: Option<RemoteConfig>,
    /// Directory backing the local cache
    pub cache_dir: PathBuf,
    /// How long a live subscription may take to confirm
    pub subscribe_timeout: Duration,
    /// Polling period once live updates are unavailable
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        // Both halves must be present; anything less means cache-only.
        let url = non_empty(lookup("REMOTE_DATABASE_URL"));
        let credential = non_empty(lookup("REMOTE_DATABASE_KEY"));
        let remote = match (url, credential) {
            (Some(url), Some(credential)) => Some(RemoteConfig { url, credential }),
            _ => None,
        };

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".tandem-cache"));

        let subscribe_timeout = duration_ms(&lookup, "SUBSCRIBE_TIMEOUT_MS")?;
        let poll_interval = duration_ms(&lookup, "POLL_INTERVAL_MS")?;

        Ok(Self {
            host,
            port,
            remote,
            cache_dir,
            subscribe_timeout,
            poll_interval,
        })
    }

    pub fn remote_configured(&self) -> bool {
        self.remote.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn duration_ms<F>(lookup: &F, name: &'static str) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(ConfigError::InvalidDuration(name)),
        },
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value, expected a positive number of milliseconds")]
    InvalidDuration(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.remote.is_none());
        assert_eq!(config.cache_dir, PathBuf::from(".tandem-cache"));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn remote_requires_both_url_and_key() {
        let only_url =
            Config::from_lookup(lookup(&[("REMOTE_DATABASE_URL", "postgres://db/app")])).unwrap();
        assert!(!only_url.remote_configured());

        let blank_key = Config::from_lookup(lookup(&[
            ("REMOTE_DATABASE_URL", "postgres://db/app"),
            ("REMOTE_DATABASE_KEY", "  "),
        ]))
        .unwrap();
        assert!(!blank_key.remote_configured());

        let both = Config::from_lookup(lookup(&[
            ("REMOTE_DATABASE_URL", "postgres://db/app"),
            ("REMOTE_DATABASE_KEY", "s3cret"),
        ]))
        .unwrap();
        let remote = both.remote.unwrap();
        assert_eq!(remote.url, "postgres://db/app");
        assert_eq!(remote.credential, "s3cret");
        assert!(!format!("{remote:?}").contains("s3cret"));
    }

    #[test]
    fn custom_timings() {
        let config = Config::from_lookup(lookup(&[
            ("SUBSCRIBE_TIMEOUT_MS", "250"),
            ("POLL_INTERVAL_MS", "1000"),
        ]))
        .unwrap();
        assert_eq!(config.subscribe_timeout, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("PORT", "http")])),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("POLL_INTERVAL_MS", "0")])),
            Err(ConfigError::InvalidDuration("POLL_INTERVAL_MS"))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("SUBSCRIBE_TIMEOUT_MS", "soon")])),
            Err(ConfigError::InvalidDuration("SUBSCRIBE_TIMEOUT_MS"))
        ));
    }
}
