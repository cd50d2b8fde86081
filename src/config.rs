use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{BlockingPolicy, EngineConfig, ResourceDeletePolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server settings, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lock_timeout_ms: u64 = parse_or(&lookup, "SLOTGUARD_LOCK_TIMEOUT_MS", 5000)?;
        Ok(Self {
            port: parse_or(&lookup, "SLOTGUARD_PORT", 5433)?,
            bind: lookup("SLOTGUARD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SLOTGUARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("SLOTGUARD_PASSWORD").unwrap_or_else(|| "slotguard".into()),
            max_connections: parse_or(&lookup, "SLOTGUARD_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "SLOTGUARD_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "SLOTGUARD_METRICS_PORT")?,
            tls_cert: lookup("SLOTGUARD_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("SLOTGUARD_TLS_KEY").map(PathBuf::from),
            engine: EngineConfig {
                blocking_policy: match lookup("SLOTGUARD_BLOCKING_POLICY") {
                    None => BlockingPolicy::default(),
                    Some(v) => match v.to_lowercase().as_str() {
                        "asymmetric" => BlockingPolicy::Asymmetric,
                        "uniform" => BlockingPolicy::Uniform,
                        _ => return Err(invalid("SLOTGUARD_BLOCKING_POLICY", v, "expected asymmetric or uniform")),
                    },
                },
                resource_delete: match lookup("SLOTGUARD_RESOURCE_DELETE") {
                    None => ResourceDeletePolicy::default(),
                    Some(v) => match v.to_lowercase().as_str() {
                        "block" => ResourceDeletePolicy::Block,
                        "cascade" => ResourceDeletePolicy::Cascade,
                        _ => return Err(invalid("SLOTGUARD_RESOURCE_DELETE", v, "expected block or cascade")),
                    },
                },
                release_cancelled: parse_or(&lookup, "SLOTGUARD_RELEASE_CANCELLED", false)?,
                lock_timeout: Duration::from_millis(lock_timeout_ms),
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotguard.wal")
    }
}

fn invalid(var: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        reason: reason.to_string(),
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(v) => match v.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(invalid(var, v, e)),
        },
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}
