use serde::{Deserialize, Serialize};
use anyhow::{Result, Context};
use std::path::{Path, PathBuf};

use crate::admission::DEFAULT_CAPACITY;
use crate::dedup::MAX_WINDOW_SECS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dedup: DedupConfig,
    pub source: SourceConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum Hamming distance for two messages to share an incident.
    pub similarity_threshold: u8,
    /// Minimum seconds between two alerts for the same incident.
    pub realert_window_secs: u64,
    pub admission_capacity: usize,
    /// Forget incidents not alerted for this long. Unset keeps them forever.
    pub eviction_horizon_secs: Option<u64>,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Redis,
    Stdin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub format: RecordFormat,
    pub redis_url: String,
    pub list_key: String,
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub enabled: bool,
    pub alert_url: Option<String>,
    pub title: String,
    pub timeout_secs: u64,
    pub verify_certificates: bool,
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Config {
    /// Defaults, then the first config file found, then `ALERTER_*` environment variables.
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file();
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .context("Failed to build default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("ALERTER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.set_defaults()?;
        config.validate()?;

        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ALERTER_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let possible_paths = vec![
            PathBuf::from("config.yaml"),
            PathBuf::from("config.yml"),
            PathBuf::from("/etc/log-alerter/config.yaml"),
        ];

        possible_paths.into_iter().find(|path| path.exists())
    }

    fn set_defaults(&mut self) -> Result<()> {
        if self.delivery.instance_name.is_none() {
            self.delivery.instance_name = Some(
                hostname::get()
                    .context("Failed to get hostname")?
                    .to_string_lossy()
                    .to_string()
            );
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.dedup.similarity_threshold > 64 {
            anyhow::bail!(
                "Similarity threshold must be between 0 and 64, got {}",
                self.dedup.similarity_threshold
            );
        }

        if self.dedup.admission_capacity == 0 {
            anyhow::bail!("Admission capacity must be greater than 0");
        }

        if self.dedup.maintenance_interval_secs == 0 {
            anyhow::bail!("Maintenance interval must be greater than 0");
        }

        if self.dedup.realert_window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "Re-alert window must be at most {}s, got {}s",
                MAX_WINDOW_SECS,
                self.dedup.realert_window_secs
            );
        }

        if let Some(horizon) = self.dedup.eviction_horizon_secs {
            if horizon > MAX_WINDOW_SECS {
                anyhow::bail!(
                    "Eviction horizon must be at most {}s, got {}s",
                    MAX_WINDOW_SECS,
                    horizon
                );
            }
            if horizon < self.dedup.realert_window_secs {
                anyhow::bail!(
                    "Eviction horizon ({}s) must not be shorter than the re-alert window ({}s)",
                    horizon,
                    self.dedup.realert_window_secs
                );
            }
        }

        if self.source.kind == SourceKind::Redis {
            if self.source.list_key.trim().is_empty() {
                anyhow::bail!("Redis list key is required");
            }
            if self.source.poll_timeout_secs == 0 {
                anyhow::bail!("Poll timeout must be greater than 0");
            }
            redis::Client::open(self.source.redis_url.as_str())
                .with_context(|| format!("Invalid Redis URL: {}", self.source.redis_url))?;
        }

        if self.delivery.enabled {
            let url = self
                .delivery
                .alert_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .context("Alert URL is required when delivery is enabled")?;
            reqwest::Url::parse(url)
                .with_context(|| format!("Invalid alert URL: {}", url))?;

            if self.delivery.timeout_secs == 0 {
                anyhow::bail!("Delivery timeout must be greater than 0");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dedup: DedupConfig {
                similarity_threshold: 3,
                realert_window_secs: 3600,
                admission_capacity: DEFAULT_CAPACITY,
                eviction_horizon_secs: None,
                maintenance_interval_secs: 300,
            },
            source: SourceConfig {
                kind: SourceKind::Redis,
                format: RecordFormat::Json,
                redis_url: "redis://127.0.0.1:6379/0".to_string(),
                list_key: "console-err".to_string(),
                poll_timeout_secs: 1,
            },
            delivery: DeliveryConfig {
                enabled: true,
                alert_url: None,
                title: "Error log alert".to_string(),
                timeout_secs: 5,
                verify_certificates: false,
                instance_name: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: Some(PathBuf::from("./logs")),
                file_prefix: "log-alerter".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
dedup:
  similarity_threshold: 5
  realert_window_secs: 600
  eviction_horizon_secs: 86400
source:
  kind: stdin
  format: text
delivery:
  alert_url: "https://hooks.example.com/robot/abc"
  instance_name: alerter-1
"#,
        );

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.dedup.similarity_threshold, 5);
        assert_eq!(config.dedup.realert_window_secs, 600);
        assert_eq!(config.dedup.eviction_horizon_secs, Some(86400));
        assert_eq!(config.dedup.admission_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.source.kind, SourceKind::Stdin);
        assert_eq!(config.source.format, RecordFormat::Text);
        assert_eq!(config.delivery.timeout_secs, 5);
        assert_eq!(config.delivery.instance_name.as_deref(), Some("alerter-1"));
    }

    #[test]
    fn test_missing_alert_url_is_fatal() {
        let file = write_config("source:\n  kind: stdin\n");
        let err = Config::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Alert URL is required"));
    }

    #[test]
    fn test_delivery_disabled_needs_no_url() {
        let file = write_config("source:\n  kind: stdin\ndelivery:\n  enabled: false\n");
        let config = Config::load_from(Some(file.path())).unwrap();
        assert!(config.delivery.instance_name.is_some());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let file = write_config(
            "dedup:\n  similarity_threshold: 65\ndelivery:\n  enabled: false\n",
        );
        let err = Config::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("between 0 and 64"));
    }

    #[test]
    fn test_non_numeric_threshold_is_rejected() {
        let file = write_config(
            "dedup:\n  similarity_threshold: lots\ndelivery:\n  enabled: false\n",
        );
        assert!(Config::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_horizon_shorter_than_window() {
        let file = write_config(
            "dedup:\n  realert_window_secs: 3600\n  eviction_horizon_secs: 60\ndelivery:\n  enabled: false\n",
        );
        let err = Config::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Eviction horizon"));
    }

    #[test]
    fn test_window_beyond_duration_range_is_rejected() {
        let file = write_config(
            "dedup:\n  realert_window_secs: 18446744073709551615\ndelivery:\n  enabled: false\n",
        );
        let err = Config::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Re-alert window must be at most"));

        let file = write_config(&format!(
            "dedup:\n  eviction_horizon_secs: {}\ndelivery:\n  enabled: false\n",
            MAX_WINDOW_SECS + 1
        ));
        let err = Config::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Eviction horizon must be at most"));

        let file = write_config(&format!(
            "dedup:\n  realert_window_secs: {0}\n  eviction_horizon_secs: {0}\ndelivery:\n  enabled: false\n",
            MAX_WINDOW_SECS
        ));
        assert!(Config::load_from(Some(file.path())).is_ok());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let file = write_config(
            "dedup:\n  admission_capacity: 0\ndelivery:\n  enabled: false\n",
        );
        assert!(Config::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_default_roundtrips_through_yaml() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        assert!(yaml.contains("similarity_threshold: 3"));
        assert!(yaml.contains("list_key: console-err"));
    }
}
