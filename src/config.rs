//! Runtime configuration
//!
//! Every layer has its own config struct with defaults; [`Config`] bundles
//! them and can pick up `LANBEAM_*` overrides from the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::net::connection::ConnectionConfig;
use crate::net::presence::PresenceConfig;
use crate::net::transfer::TransferConfig;

pub const HEARTBEAT_ENV: &str = "LANBEAM_HEARTBEAT_SECS";
pub const PRESENCE_TIMEOUT_ENV: &str = "LANBEAM_PRESENCE_TIMEOUT_SECS";
pub const CONNECT_TIMEOUT_ENV: &str = "LANBEAM_CONNECT_TIMEOUT_SECS";
pub const OPEN_TIMEOUT_ENV: &str = "LANBEAM_OPEN_TIMEOUT_SECS";
pub const MAX_IDLE_ENV: &str = "LANBEAM_MAX_IDLE_SECS";
pub const RESPONSE_TIMEOUT_ENV: &str = "LANBEAM_RESPONSE_TIMEOUT_SECS";
pub const DOWNLOAD_DIR_ENV: &str = "LANBEAM_DOWNLOAD_DIR";

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive number of seconds, got {value:?}")]
    InvalidDuration { var: &'static str, value: Arc<str> },
}

/// Configuration for all layers
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub presence: PresenceConfig,
    pub connection: ConnectionConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults with overrides from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(d) = duration_var(&lookup, HEARTBEAT_ENV)? {
            config.presence.heartbeat_interval = d;
        }
        if let Some(d) = duration_var(&lookup, PRESENCE_TIMEOUT_ENV)? {
            config.presence.presence_timeout = d;
        }
        if let Some(d) = duration_var(&lookup, CONNECT_TIMEOUT_ENV)? {
            config.transfer.connect_timeout = d;
        }
        if let Some(d) = duration_var(&lookup, OPEN_TIMEOUT_ENV)? {
            config.connection.open_timeout = d;
        }
        if let Some(d) = duration_var(&lookup, MAX_IDLE_ENV)? {
            config.connection.max_idle = d;
        }
        if let Some(d) = duration_var(&lookup, RESPONSE_TIMEOUT_ENV)? {
            config.transfer.session.response_timeout = d;
        }
        if let Some(dir) = lookup(DOWNLOAD_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.transfer.download_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let invalid = || ConfigError::InvalidDuration {
        var,
        value: Arc::from(raw.as_str()),
    };

    let secs: f64 = raw.trim().parse().map_err(|_| invalid())?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid());
    }
    debug!(var, secs, "Config override");
    Ok(Some(Duration::from_secs_f64(secs)))
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
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.presence.presence_timeout, Duration::from_secs(15));
        assert_eq!(config.transfer.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.connection.open_timeout, Duration::from_secs(10));
        assert_eq!(config.transfer.session.response_timeout, Duration::from_secs(30));
        assert_eq!(config.connection.max_idle, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides_applied() {
        let config = Config::from_lookup(lookup(&[
            (HEARTBEAT_ENV, "2"),
            (CONNECT_TIMEOUT_ENV, "0.5"),
            (OPEN_TIMEOUT_ENV, "4"),
            (RESPONSE_TIMEOUT_ENV, " 10 "),
            (DOWNLOAD_DIR_ENV, "/tmp/inbox"),
        ]))
        .unwrap();

        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.connection.open_timeout, Duration::from_secs(4));
        assert_eq!(config.transfer.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.transfer.session.response_timeout, Duration::from_secs(10));
        assert_eq!(config.transfer.download_dir, PathBuf::from("/tmp/inbox"));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        for bad in ["soon", "-1", "0", "inf"] {
            let err = Config::from_lookup(lookup(&[(MAX_IDLE_ENV, bad)])).unwrap_err();
            assert!(err.to_string().contains(MAX_IDLE_ENV));
        }
    }
}
