use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both ALLOCD_TLS_CERT and ALLOCD_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `ALLOCD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "allocd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            bind: lookup("ALLOCD_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "ALLOCD_PORT", defaults.port)?,
            data_dir: lookup("ALLOCD_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("ALLOCD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "ALLOCD_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(
                &lookup,
                "ALLOCD_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            tls_cert: lookup("ALLOCD_TLS_CERT"),
            tls_key: lookup("ALLOCD_TLS_KEY"),
            metrics_port: match lookup("ALLOCD_METRICS_PORT") {
                Some(value) => Some(parse("ALLOCD_METRICS_PORT", value)?),
                None => None,
            },
        };
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => parse(var, value),
        None => Ok(default),
    }
}
