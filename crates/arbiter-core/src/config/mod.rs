//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Arbiter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub assessment: AssessmentConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Primary confidence below which alternatives are run
    pub alternative_threshold: f64,
    /// Candidate confidence below which self-assessment is run
    pub assessment_threshold: f64,
    /// Maximum number of alternatives run in parallel
    pub max_alternatives: usize,
    /// Confidence multiplier applied to fallback results
    pub fallback_penalty: f64,
    /// Per-call timeout when a request sets no latency limit
    pub default_timeout_secs: u64,
    /// Units of work used to estimate cost against a request's max cost
    pub nominal_units: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessmentConfig {
    /// Backend that evaluates other backends' results
    pub assessor_backend: Option<String>,
    /// Evaluation confidence at or above which no improvement is attempted
    pub improvement_threshold: f64,
    /// Confidence reported when the assessor fails
    pub degraded_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub retention_days: u32,
    /// Old entries below this confidence are removed by cleanup
    pub cleanup_confidence: f64,
    /// Maximum links created for a new entry
    pub max_related: usize,
    pub suggestion_limit: usize,
    /// Entries must exceed this confidence to be suggested
    pub suggestion_min_confidence: f64,
    pub decay_half_life_days: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            alternative_threshold: 0.70,
            assessment_threshold: 0.90,
            max_alternatives: 2,
            fallback_penalty: 0.8,
            default_timeout_secs: 60,
            nominal_units: 1000,
        }
    }
}

impl AssessmentConfig {
    /// Assessor config with defaults and the given backend
    pub fn with_assessor(backend_id: impl Into<String>) -> Self {
        Self {
            assessor_backend: Some(backend_id.into()),
            ..Self::default_thresholds()
        }
    }

    fn default_thresholds() -> Self {
        Self {
            assessor_backend: None,
            improvement_threshold: 0.80,
            degraded_confidence: 0.5,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            cleanup_confidence: 0.70,
            max_related: 3,
            suggestion_limit: 3,
            suggestion_min_confidence: 0.80,
            decay_half_life_days: 30.0,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ARBITER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("arbiter")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let unit_values = [
            ("dispatch.alternative_threshold", self.dispatch.alternative_threshold),
            ("dispatch.assessment_threshold", self.dispatch.assessment_threshold),
            ("dispatch.fallback_penalty", self.dispatch.fallback_penalty),
            ("assessment.improvement_threshold", self.assessment.improvement_threshold),
            ("assessment.degraded_confidence", self.assessment.degraded_confidence),
            ("memory.cleanup_confidence", self.memory.cleanup_confidence),
            ("memory.suggestion_min_confidence", self.memory.suggestion_min_confidence),
        ];
        for (key, value) in unit_values {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0, got {}", key, value));
            }
        }

        if self.dispatch.default_timeout_secs == 0 {
            return Err(anyhow!("dispatch.default_timeout_secs must be greater than zero"));
        }
        if self.dispatch.nominal_units == 0 {
            return Err(anyhow!("dispatch.nominal_units must be greater than zero"));
        }
        if self.memory.decay_half_life_days <= 0.0 {
            return Err(anyhow!("memory.decay_half_life_days must be positive"));
        }
        if matches!(&self.assessment.assessor_backend, Some(id) if id.trim().is_empty()) {
            return Err(anyhow!("assessment.assessor_backend must not be empty"));
        }

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            // Dispatch settings
            "dispatch.alternative_threshold" => Ok(self.dispatch.alternative_threshold.to_string()),
            "dispatch.assessment_threshold" => Ok(self.dispatch.assessment_threshold.to_string()),
            "dispatch.max_alternatives" => Ok(self.dispatch.max_alternatives.to_string()),
            "dispatch.fallback_penalty" => Ok(self.dispatch.fallback_penalty.to_string()),
            "dispatch.default_timeout_secs" => Ok(self.dispatch.default_timeout_secs.to_string()),
            "dispatch.nominal_units" => Ok(self.dispatch.nominal_units.to_string()),

            // Assessment settings
            "assessment.assessor_backend" => Ok(self
                .assessment
                .assessor_backend
                .clone()
                .unwrap_or_else(|| "(not set)".to_string())),
            "assessment.improvement_threshold" => {
                Ok(self.assessment.improvement_threshold.to_string())
            }
            "assessment.degraded_confidence" => Ok(self.assessment.degraded_confidence.to_string()),

            // Memory settings
            "memory.retention_days" => Ok(self.memory.retention_days.to_string()),
            "memory.cleanup_confidence" => Ok(self.memory.cleanup_confidence.to_string()),
            "memory.max_related" => Ok(self.memory.max_related.to_string()),
            "memory.suggestion_limit" => Ok(self.memory.suggestion_limit.to_string()),
            "memory.suggestion_min_confidence" => {
                Ok(self.memory.suggestion_min_confidence.to_string())
            }
            "memory.decay_half_life_days" => Ok(self.memory.decay_half_life_days.to_string()),

            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    ///
    /// The updated configuration is validated; an invalid value leaves the
    /// configuration unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        match key {
            "dispatch.alternative_threshold" => {
                updated.dispatch.alternative_threshold = parse(key, value)?;
            }
            "dispatch.assessment_threshold" => {
                updated.dispatch.assessment_threshold = parse(key, value)?;
            }
            "dispatch.max_alternatives" => {
                updated.dispatch.max_alternatives = parse(key, value)?;
            }
            "dispatch.fallback_penalty" => {
                updated.dispatch.fallback_penalty = parse(key, value)?;
            }
            "dispatch.default_timeout_secs" => {
                updated.dispatch.default_timeout_secs = parse(key, value)?;
            }
            "dispatch.nominal_units" => {
                updated.dispatch.nominal_units = parse(key, value)?;
            }

            "assessment.assessor_backend" => {
                let value = value.trim();
                updated.assessment.assessor_backend =
                    (!value.is_empty()).then(|| value.to_string());
            }
            "assessment.improvement_threshold" => {
                updated.assessment.improvement_threshold = parse(key, value)?;
            }
            "assessment.degraded_confidence" => {
                updated.assessment.degraded_confidence = parse(key, value)?;
            }

            "memory.retention_days" => {
                updated.memory.retention_days = parse(key, value)?;
            }
            "memory.cleanup_confidence" => {
                updated.memory.cleanup_confidence = parse(key, value)?;
            }
            "memory.max_related" => {
                updated.memory.max_related = parse(key, value)?;
            }
            "memory.suggestion_limit" => {
                updated.memory.suggestion_limit = parse(key, value)?;
            }
            "memory.suggestion_min_confidence" => {
                updated.memory.suggestion_min_confidence = parse(key, value)?;
            }
            "memory.decay_half_life_days" => {
                updated.memory.decay_half_life_days = parse(key, value)?;
            }

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "dispatch.alternative_threshold",
            "dispatch.assessment_threshold",
            "dispatch.max_alternatives",
            "dispatch.fallback_penalty",
            "dispatch.default_timeout_secs",
            "dispatch.nominal_units",
            "assessment.assessor_backend",
            "assessment.improvement_threshold",
            "assessment.degraded_confidence",
            "memory.retention_days",
            "memory.cleanup_confidence",
            "memory.max_related",
            "memory.suggestion_limit",
            "memory.suggestion_min_confidence",
            "memory.decay_half_life_days",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self::default_thresholds()
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.dispatch.alternative_threshold, 0.70);
        assert_eq!(config.dispatch.assessment_threshold, 0.90);
        assert_eq!(config.dispatch.max_alternatives, 2);
        assert_eq!(config.dispatch.fallback_penalty, 0.8);
        assert_eq!(config.dispatch.default_timeout_secs, 60);

        assert!(config.assessment.assessor_backend.is_none());
        assert_eq!(config.assessment.improvement_threshold, 0.80);
        assert_eq!(config.assessment.degraded_confidence, 0.5);

        assert_eq!(config.memory.retention_days, 90);
        assert_eq!(config.memory.cleanup_confidence, 0.70);
        assert_eq!(config.memory.max_related, 3);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("assessment.assessor_backend", "creative").unwrap();
        config.set("dispatch.max_alternatives", "3").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.assessment.assessor_backend.as_deref(), Some("creative"));
        assert_eq!(loaded.dispatch.max_alternatives, 3);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.memory.retention_days, 90);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[assessment]\nassessor_backend = \"balanced\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.assessment.assessor_backend.as_deref(), Some("balanced"));
        assert_eq!(config.assessment.improvement_threshold, 0.80);
        assert_eq!(config.dispatch.default_timeout_secs, 60);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[dispatch]\nfallback_penalty = 1.5\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();

        assert!(config.set("dispatch.alternative_threshold", "1.2").is_err());
        assert!(config.set("dispatch.default_timeout_secs", "0").is_err());
        assert!(config.set("dispatch.max_alternatives", "two").is_err());
        assert!(config.set("unknown.key", "1").is_err());

        assert_eq!(config.dispatch.alternative_threshold, 0.70);
        assert_eq!(config.dispatch.default_timeout_secs, 60);
    }

    #[test]
    fn test_list_covers_every_key() {
        let config = Config::default();
        let list = config.list().unwrap();

        assert_eq!(list.len(), 15);
        assert!(list.contains(&(
            "assessment.assessor_backend".to_string(),
            "(not set)".to_string()
        )));
        for (key, value) in &list {
            assert_eq!(&config.get(key).unwrap(), value);
        }
    }
}
