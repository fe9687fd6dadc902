//! Runtime configuration
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example TOML configuration:
//! ```toml
//! [pattern]
//! max_partial_matches = 50000
//!
//! [aggregation]
//! reclaim_group_after_ms = 600000
//! reclaim_frequency_ms = 60000
//!
//! [clock]
//! tick_interval_ms = 100
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pattern: PatternConfig,
    pub aggregation: AggregationConfig,
    pub clock: ClockConfig,
    pub logging: LoggingConfig,
}

/// Pattern engine limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Maximum number of live filter states per statement instance; new
    /// partial matches beyond this are refused.
    pub max_partial_matches: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            max_partial_matches: 10_000,
        }
    }
}

/// Aggregation group retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Release groups not updated for this long (engine time). Unset keeps
    /// groups until the statement is destroyed.
    pub reclaim_group_after_ms: Option<u64>,

    /// Minimum engine-time interval between two reclamation sweeps.
    pub reclaim_frequency_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            reclaim_group_after_ms: None,
            reclaim_frequency_ms: 5_000,
        }
    }
}

impl AggregationConfig {
    pub fn reclaim_after(&self) -> Option<Duration> {
        self.reclaim_group_after_ms.map(Duration::from_millis)
    }

    pub fn reclaim_frequency(&self) -> Duration {
        Duration::from_millis(self.reclaim_frequency_ms)
    }
}

/// Wall-clock driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub tick_interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
        }
    }
}

impl ClockConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pattern.max_partial_matches, 10_000);
        assert_eq!(config.aggregation.reclaim_after(), None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing_keeps_defaults_for_missing_sections() {
        let toml = r#"
[aggregation]
reclaim_group_after_ms = 30000

[logging]
format = "json"
"#;
        let config = RuntimeConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.aggregation.reclaim_after(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.aggregation.reclaim_frequency_ms, 5_000);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.pattern, PatternConfig::default());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
pattern:
  max_partial_matches: 64
clock:
  tick_interval_ms: 250
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.pattern.max_partial_matches, 64);
        assert_eq!(config.clock.tick_interval_ms, 250);
    }

    #[test]
    fn test_load_dispatches_on_extension() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pattern]\nmax_partial_matches = 7").unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.pattern.max_partial_matches, 7);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
    }
}
