use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, DEFAULT_BASE_URL, drug_event_counts};
use crate::domain::{Period, Quarter};
use crate::error::BulkError;
use crate::orchestrator::OrchestratorSettings;
use crate::store::Store;

pub const CONFIG_FILE: &str = "openfda-bulk.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub base_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub group_size: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub fetch_backoff_secs: Option<u64>,
    #[serde(default)]
    pub max_group_retries: Option<u32>,
    #[serde(default)]
    pub group_retry_backoff_secs: Option<u64>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// `{"2024": {"q1": 30}}`; entries extend or replace the built-in table.
    #[serde(default)]
    pub counts: BTreeMap<String, BTreeMap<Quarter, u32>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_url: String,
    pub base_dir: Option<Utf8PathBuf>,
    pub settings: OrchestratorSettings,
    pub request_timeout: Duration,
    pub counts: BTreeMap<Period, u32>,
}

impl ResolvedConfig {
    pub fn catalog(&self, store: Store) -> Catalog {
        Catalog::new(self.counts.clone(), self.base_url.clone(), store)
    }

    pub fn store(&self) -> Result<Store, BulkError> {
        match &self.base_dir {
            Some(dir) => Ok(Store::new_with_root(dir.clone())),
            None => Store::new(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Without an explicit path a missing `openfda-bulk.json` means defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BulkError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BulkError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BulkError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BulkError> {
        let defaults = OrchestratorSettings::default();
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };

        let settings = OrchestratorSettings {
            group_size: config.group_size.unwrap_or(defaults.group_size),
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts),
            fetch_backoff: secs(config.fetch_backoff_secs, defaults.fetch_backoff),
            max_group_retries: config
                .max_group_retries
                .unwrap_or(defaults.max_group_retries),
            group_retry_backoff: secs(
                config.group_retry_backoff_secs,
                defaults.group_retry_backoff,
            ),
            poll_interval: secs(config.poll_interval_secs, defaults.poll_interval),
            max_wait: secs(config.max_wait_secs, defaults.max_wait),
        };
        validate_settings(&settings)?;

        let mut counts = drug_event_counts();
        for (year, quarters) in config.counts {
            let year = year
                .trim()
                .parse::<u16>()
                .map_err(|_| BulkError::ConfigParse(format!("invalid year in counts: {year}")))?;
            for (quarter, count) in quarters {
                if count == 0 {
                    return Err(BulkError::ConfigParse(format!(
                        "count for {year}{quarter} must be positive"
                    )));
                }
                counts.insert(Period::new(year, quarter), count);
            }
        }

        Ok(ResolvedConfig {
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            base_dir: config.base_dir,
            settings,
            request_timeout: secs(config.request_timeout_secs, Duration::from_secs(300)),
            counts,
        })
    }
}

pub fn validate_settings(settings: &OrchestratorSettings) -> Result<(), BulkError> {
    if settings.group_size == 0 {
        return Err(BulkError::InvalidGroupSize);
    }
    if settings.max_attempts == 0 {
        return Err(BulkError::ConfigParse(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    if settings.max_group_retries == 0 {
        return Err(BulkError::ConfigParse(
            "max_group_retries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.base_url, DEFAULT_BASE_URL);
        assert_eq!(resolved.settings, OrchestratorSettings::default());
        assert_eq!(resolved.counts.len(), 40);
    }

    #[test]
    fn counts_override_and_extend_table() {
        let config: Config = serde_json::from_str(
            r#"{"group_size": 5, "counts": {"2014": {"q1": 21}, "2024": {"q1": 30}}}"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.settings.group_size, 5);
        assert_eq!(resolved.counts[&"2014q1".parse().unwrap()], 21);
        assert_eq!(resolved.counts[&"2024q1".parse().unwrap()], 30);
        assert_eq!(resolved.counts.len(), 41);
    }

    #[test]
    fn zero_group_size_is_rejected() {
        let config = Config {
            group_size: Some(0),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(BulkError::InvalidGroupSize)
        );
    }
}
