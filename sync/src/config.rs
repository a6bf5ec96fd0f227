//! Configuration management for the sync runtime.

use laguna_engine::{reconcile::DEFAULT_MAX_RETRIES, BackoffPolicy, CollectionName};
use std::env;
use std::path::PathBuf;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Directory holding the persisted state file
    pub data_dir: PathBuf,
    /// Device node ID; generated on first sign-in when unset
    pub node_id: Option<String>,
    /// Retry backoff for pushes and subscriptions
    pub backoff: BackoffPolicy,
    /// Retries before an unreachable push fails
    pub max_retries: u32,
    /// Collections to subscribe to; all schema collections when unset
    pub collections: Option<Vec<CollectionName>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("laguna-data"),
            node_id: None,
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            collections: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let data_dir = lookup("LAGUNA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let node_id = lookup("LAGUNA_NODE_ID").filter(|id| !id.trim().is_empty());

        let base_ms = parse_var(&lookup, "LAGUNA_BACKOFF_BASE_MS", defaults.backoff.base_ms)?;
        let cap_ms = parse_var(&lookup, "LAGUNA_BACKOFF_CAP_MS", defaults.backoff.cap_ms)?;
        let jitter = parse_var(&lookup, "LAGUNA_BACKOFF_JITTER", defaults.backoff.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidJitter(jitter));
        }
        if base_ms == 0 || cap_ms < base_ms {
            return Err(ConfigError::InvalidBackoff { base_ms, cap_ms });
        }

        let max_retries = parse_var(&lookup, "LAGUNA_MAX_RETRIES", defaults.max_retries)?;

        let collections = lookup("LAGUNA_COLLECTIONS").map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        });

        Ok(Self {
            data_dir,
            node_id,
            backoff: BackoffPolicy::new(base_ms, cap_ms, jitter),
            max_retries,
            collections,
        })
    }

    /// Builder-style method to set the data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Builder-style method to set the retry policy.
    pub fn with_retry_policy(mut self, backoff: BackoffPolicy, max_retries: u32) -> Self {
        self.backoff = backoff;
        self.max_retries = max_retries;
        self
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var: name, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {var} value: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("LAGUNA_BACKOFF_JITTER must be between 0 and 1, got {0}")]
    InvalidJitter(f64),

    #[error("Invalid backoff: base {base_ms}ms, cap {cap_ms}ms")]
    InvalidBackoff { base_ms: u64, cap_ms: u64 },
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
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.backoff.base_ms, 1_000);
        assert_eq!(config.backoff.cap_ms, 60_000);
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn reads_all_variables() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("LAGUNA_DATA_DIR", "/data/laguna"),
            ("LAGUNA_NODE_ID", "pixel-7"),
            ("LAGUNA_BACKOFF_BASE_MS", "500"),
            ("LAGUNA_BACKOFF_CAP_MS", "30000"),
            ("LAGUNA_BACKOFF_JITTER", "0.1"),
            ("LAGUNA_MAX_RETRIES", "3"),
            ("LAGUNA_COLLECTIONS", "figuras, notificaciones,,"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/data/laguna"));
        assert_eq!(config.node_id.as_deref(), Some("pixel-7"));
        assert_eq!(config.backoff.base_ms, 500);
        assert_eq!(config.backoff.cap_ms, 30_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(
            config.collections,
            Some(vec!["figuras".to_string(), "notificaciones".to_string()])
        );
    }

    #[test]
    fn rejects_bad_numbers() {
        let result = SyncConfig::from_lookup(lookup(&[("LAGUNA_MAX_RETRIES", "many")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidNumber { var: "LAGUNA_MAX_RETRIES", .. })
        ));
    }

    #[test]
    fn rejects_bad_backoff() {
        let jitter = SyncConfig::from_lookup(lookup(&[("LAGUNA_BACKOFF_JITTER", "1.5")]));
        assert!(matches!(jitter, Err(ConfigError::InvalidJitter(_))));

        let inverted = SyncConfig::from_lookup(lookup(&[
            ("LAGUNA_BACKOFF_BASE_MS", "5000"),
            ("LAGUNA_BACKOFF_CAP_MS", "1000"),
        ]));
        assert!(matches!(inverted, Err(ConfigError::InvalidBackoff { .. })));
    }

    #[test]
    fn blank_node_id_is_unset() {
        let config = SyncConfig::from_lookup(lookup(&[("LAGUNA_NODE_ID", "  ")])).unwrap();
        assert!(config.node_id.is_none());
    }
}
