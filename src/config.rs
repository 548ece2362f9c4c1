use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Server settings, read from `ALLOTMENT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub activation_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "allotment".into(),
            max_connections: 256,
            compact_threshold: 1000,
            activation_interval: Duration::from_secs(60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("ALLOTMENT_TLS_CERT and ALLOTMENT_TLS_KEY must be set together")]
    TlsPair,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let config = Self {
            bind: get("ALLOTMENT_BIND").unwrap_or(defaults.bind),
            port: parse_or(&get, "ALLOTMENT_PORT", defaults.port)?,
            data_dir: get("ALLOTMENT_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("ALLOTMENT_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&get, "ALLOTMENT_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(&get, "ALLOTMENT_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            activation_interval: Duration::from_secs(parse_or(
                &get,
                "ALLOTMENT_ACTIVATION_INTERVAL_SECS",
                defaults.activation_interval.as_secs(),
            )?),
            metrics_port: get("ALLOTMENT_METRICS_PORT")
                .map(|v| parse("ALLOTMENT_METRICS_PORT", &v))
                .transpose()?,
            tls_cert: get("ALLOTMENT_TLS_CERT"),
            tls_key: get("ALLOTMENT_TLS_KEY"),
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Zero("ALLOTMENT_MAX_CONNECTIONS"));
        }
        if config.compact_threshold == 0 {
            return Err(ConfigError::Zero("ALLOTMENT_COMPACT_THRESHOLD"));
        }
        if config.activation_interval.is_zero() {
            return Err(ConfigError::Zero("ALLOTMENT_ACTIVATION_INTERVAL_SECS"));
        }
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("allotment.wal")
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(v) => parse(var, &v),
        None => Ok(default),
    }
}
