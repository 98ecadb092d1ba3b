use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0}")]
    Tls(&'static str),

    #[error("catalog error: {0}")]
    Catalog(String),
}

/// Server configuration, read from `BRANCHBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub lookahead_days: u32,
    pub notify_max_attempts: u32,
    pub notify_backoff: Duration,
    pub metrics_port: Option<u16>,
    pub log_json: bool,
    pub catalog_path: Option<PathBuf>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub resend_api_key: Option<String>,
    pub resend_from: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "branchbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            store_timeout: Duration::from_secs(5),
            lookahead_days: 28,
            notify_max_attempts: 3,
            notify_backoff: Duration::from_millis(500),
            metrics_port: None,
            log_json: false,
            catalog_path: None,
            tls_cert: None,
            tls_key: None,
            resend_api_key: None,
            resend_from: "Appointments <onboarding@resend.dev>".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let cfg = Self {
            bind: lookup("BRANCHBOOK_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "BRANCHBOOK_PORT")?.unwrap_or(d.port),
            data_dir: lookup("BRANCHBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("BRANCHBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "BRANCHBOOK_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "BRANCHBOOK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            store_timeout: parsed(&lookup, "BRANCHBOOK_STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.store_timeout),
            lookahead_days: parsed(&lookup, "BRANCHBOOK_LOOKAHEAD_DAYS")?.unwrap_or(d.lookahead_days),
            notify_max_attempts: parsed(&lookup, "BRANCHBOOK_NOTIFY_MAX_ATTEMPTS")?
                .unwrap_or(d.notify_max_attempts),
            notify_backoff: parsed(&lookup, "BRANCHBOOK_NOTIFY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.notify_backoff),
            metrics_port: parsed(&lookup, "BRANCHBOOK_METRICS_PORT")?,
            log_json: parsed::<u8>(&lookup, "BRANCHBOOK_LOG_JSON")?.is_some_and(|v| v != 0),
            catalog_path: lookup("BRANCHBOOK_CATALOG").map(PathBuf::from),
            tls_cert: lookup("BRANCHBOOK_TLS_CERT"),
            tls_key: lookup("BRANCHBOOK_TLS_KEY"),
            resend_api_key: lookup("RESEND_API_KEY").filter(|k| !k.is_empty()),
            resend_from: lookup("RESEND_FROM").unwrap_or(d.resend_from),
        };
        if cfg.notify_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                var: "BRANCHBOOK_NOTIFY_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err(ConfigError::Tls(
                "both BRANCHBOOK_TLS_CERT and BRANCHBOOK_TLS_KEY must be set, or neither",
            ));
        }
        Ok(cfg)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.lookahead_days, 28);
        assert_eq!(cfg.notify_max_attempts, 3);
        assert!(cfg.metrics_port.is_none());
        assert!(!cfg.log_json);
    }

    #[test]
    fn overrides_parsed() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("BRANCHBOOK_PORT", "6000"),
            ("BRANCHBOOK_STORE_TIMEOUT_MS", "250"),
            ("BRANCHBOOK_LOG_JSON", "1"),
            ("BRANCHBOOK_CATALOG", "/etc/branchbook/catalog.toml"),
            ("RESEND_API_KEY", "re_123"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.store_timeout, Duration::from_millis(250));
        assert!(cfg.log_json);
        assert_eq!(cfg.catalog_path, Some(PathBuf::from("/etc/branchbook/catalog.toml")));
        assert_eq!(cfg.resend_api_key.as_deref(), Some("re_123"));
    }

    #[test]
    fn bad_number_rejected() {
        let err = Config::from_lookup(lookup_from(&[("BRANCHBOOK_PORT", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BRANCHBOOK_PORT"));
    }

    #[test]
    fn half_tls_config_rejected() {
        let err = Config::from_lookup(lookup_from(&[("BRANCHBOOK_TLS_CERT", "cert.pem")])).unwrap_err();
        assert!(matches!(err, ConfigError::Tls(_)));
    }

    #[test]
    fn zero_notify_attempts_rejected() {
        let result = Config::from_lookup(lookup_from(&[("BRANCHBOOK_NOTIFY_MAX_ATTEMPTS", "0")]));
        assert!(result.is_err());
    }
}
