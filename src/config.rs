//! Server settings read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::suggest::DEFAULT_GEMINI_MODEL;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// No key means the fixed three-phase plan is always used.
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub suggest_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "orsched".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.into(),
            suggest_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults; blank strings count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            port: get("ORSCHED_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            bind: get("ORSCHED_BIND").unwrap_or(defaults.bind),
            data_dir: get("ORSCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("ORSCHED_PASSWORD").unwrap_or(defaults.password),
            max_connections: get("ORSCHED_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: get("ORSCHED_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            metrics_port: get("ORSCHED_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: get("ORSCHED_TLS_CERT"),
            tls_key: get("ORSCHED_TLS_KEY"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            suggest_timeout: get("ORSCHED_SUGGEST_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.suggest_timeout),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("orsched.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
