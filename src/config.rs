//! Process configuration, resolved once at startup (see §6.4).
//!
//! Every key can be overridden via environment variable; anything left unset
//! falls back to the defaults below. Nothing re-reads the environment after
//! `Config::from_env` returns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Error};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub proxy_base_url: String,
    pub executor_request_timeout: Duration,
    pub cache_root: PathBuf,
    pub cache_quota_bytes: u64,
    pub cache_sweep_interval: Duration,
    pub session_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub cors_origins: CorsOrigins,
    pub cors_credentials: bool,
}

#[derive(Debug, Clone)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

impl CorsOrigins {
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            CorsOrigins::Any => true,
            CorsOrigins::List(list) => list.iter().any(|o| o == origin),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|err| anyhow::format_err!("invalid value for {}: {}", key, err)),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow::format_err!("cannot read {}: {}", key, err)),
    }
}

impl Config {
    /// Loads configuration from the environment, applying the defaults
    /// documented in the design. Fails the process at init on malformed values.
    pub fn from_env() -> Result<Self, Error> {
        let listen: SocketAddr = env_or("BROKER_LISTEN", "127.0.0.1:8080".to_string())?
            .parse()
            .context("BROKER_LISTEN must be a host:port pair")?;

        let proxy_base_url = std::env::var("BROKER_PROXY_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let timeout_secs: u64 = env_or("BROKER_REQUEST_TIMEOUT_SECS", 120u64)?;
        let cache_root: String =
            env_or("BROKER_CACHE_ROOT", "/var/cache/gemini-broker".to_string())?;
        let cache_quota_bytes: u64 = env_or("BROKER_CACHE_QUOTA_BYTES", 10_000_000_000u64)?;
        let cache_sweep_secs: u64 = env_or("BROKER_CACHE_SWEEP_SECS", 60u64)?;
        let session_timeout_secs: u64 = env_or("BROKER_SESSION_TIMEOUT_SECS", 900u64)?;
        let session_sweep_secs: u64 = env_or("BROKER_SESSION_SWEEP_SECS", 60u64)?;

        let cors_origins = match std::env::var("BROKER_CORS_ORIGINS") {
            Ok(val) if val.trim() == "*" || val.trim().is_empty() => CorsOrigins::Any,
            Ok(val) => CorsOrigins::List(val.split(',').map(|s| s.trim().to_string()).collect()),
            Err(_) => CorsOrigins::Any,
        };
        let cors_credentials: bool = env_or("BROKER_CORS_CREDENTIALS", false)?;

        Ok(Config {
            listen,
            proxy_base_url,
            executor_request_timeout: Duration::from_secs(timeout_secs),
            cache_root: PathBuf::from(cache_root),
            cache_quota_bytes,
            cache_sweep_interval: Duration::from_secs(cache_sweep_secs),
            session_timeout: Duration::from_secs(session_timeout_secs),
            session_sweep_interval: Duration::from_secs(session_sweep_secs),
            cors_origins,
            cors_credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        for key in [
            "BROKER_LISTEN",
            "BROKER_PROXY_BASE_URL",
            "BROKER_REQUEST_TIMEOUT_SECS",
            "BROKER_CACHE_ROOT",
            "BROKER_CACHE_QUOTA_BYTES",
            "BROKER_CACHE_SWEEP_SECS",
            "BROKER_SESSION_TIMEOUT_SECS",
            "BROKER_SESSION_SWEEP_SECS",
            "BROKER_CORS_ORIGINS",
            "BROKER_CORS_CREDENTIALS",
        ] {
            std::env::remove_var(key);
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.cache_quota_bytes, 10_000_000_000);
        assert!(matches!(config.cors_origins, CorsOrigins::Any));
        assert!(!config.cors_credentials);
    }

    #[test]
    fn parses_cors_list() {
        let origins = CorsOrigins::List(vec!["https://a.example".into(), "https://b.example".into()]);
        assert!(origins.allows("https://a.example"));
        assert!(!origins.allows("https://c.example"));
    }
}
