//! Engine configuration
//!
//! Loaded from JSON. Every field has a default so a minimal document only
//! needs to name the project.

use crate::compression::{CompressionMethod, CompressionSettings};
use crate::error::{Result, SpatialDbError};
use crate::types::validate_name;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_project() -> String {
    "default".to_string()
}

fn default_cache_index_key() -> String {
    "cache_index".to_string()
}

fn default_dirty_index_key() -> String {
    "dirty_index".to_string()
}

fn default_durable_index_key() -> String {
    "durable_index".to_string()
}

fn default_lock_name() -> String {
    "cache_lock".to_string()
}

fn default_upper_bound() -> f64 {
    70.0
}

fn default_lower_bound() -> f64 {
    50.0
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Memory-ceiling policy for the cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Eviction starts once the memory ratio exceeds this percentage
    #[serde(default = "default_upper_bound")]
    pub upper_bound_percent: f64,

    /// Eviction continues until the ratio drops below this percentage
    #[serde(default = "default_lower_bound")]
    pub lower_bound_percent: f64,

    /// Interval between checks of the background loop
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Number of LRU entries removed per round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Write dirty cuboids to the durable tier before evicting them
    #[serde(default = "default_true")]
    pub write_back: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            upper_bound_percent: default_upper_bound(),
            lower_bound_percent: default_lower_bound(),
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            write_back: true,
        }
    }
}

impl EvictionConfig {
    pub fn with_bounds(mut self, upper: f64, lower: f64) -> Self {
        self.upper_bound_percent = upper;
        self.lower_bound_percent = lower;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_write_back(mut self, write_back: bool) -> Self {
        self.write_back = write_back;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !in_range(self.upper_bound_percent) || !in_range(self.lower_bound_percent) {
            return Err(SpatialDbError::Configuration(
                "eviction bounds must be percentages in (0, 100]".into(),
            ));
        }
        if self.lower_bound_percent > self.upper_bound_percent {
            return Err(SpatialDbError::Configuration(format!(
                "lower bound {} exceeds upper bound {}",
                self.lower_bound_percent, self.upper_bound_percent
            )));
        }
        if self.batch_size == 0 {
            return Err(SpatialDbError::Configuration(
                "eviction batch size must be positive".into(),
            ));
        }
        if self.interval_ms == 0 {
            return Err(SpatialDbError::Configuration(
                "eviction interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of a [`crate::SpatialDb`] instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Project name, the first component of every key
    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default)]
    pub compression: CompressionSettings,

    /// Sorted set recording which cuboids are cached, scored by recency
    #[serde(default = "default_cache_index_key")]
    pub cache_index_key: String,

    /// Sorted set of cached cuboids not yet written to the durable tier
    #[serde(default = "default_dirty_index_key")]
    pub dirty_index_key: String,

    /// Sorted set recording which super-cuboids exist durably
    #[serde(default = "default_durable_index_key")]
    pub durable_index_key: String,

    /// Name of the readers-writer lock guarding the cache
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    #[serde(default)]
    pub eviction: EvictionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            compression: CompressionSettings::default(),
            cache_index_key: default_cache_index_key(),
            dirty_index_key: default_dirty_index_key(),
            durable_index_key: default_durable_index_key(),
            lock_name: default_lock_name(),
            eviction: EvictionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: u8) -> Self {
        self.compression = CompressionSettings::new(method, level);
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.project)?;
        for key in [
            &self.cache_index_key,
            &self.dirty_index_key,
            &self.durable_index_key,
            &self.lock_name,
        ] {
            validate_name(key)?;
        }
        if self.cache_index_key == self.dirty_index_key
            || self.cache_index_key == self.durable_index_key
            || self.dirty_index_key == self.durable_index_key
        {
            return Err(SpatialDbError::Configuration(
                "index keys must be distinct".into(),
            ));
        }
        self.eviction.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.eviction.interval_ms, 2000);
        assert_eq!(config.compression.method, CompressionMethod::Zstd);
    }

    #[test]
    fn test_minimal_json() {
        let config = EngineConfig::from_json_str(r#"{"project": "kasthuri11"}"#).unwrap();
        assert_eq!(config.project, "kasthuri11");
        assert_eq!(config.eviction.batch_size, 100);
        assert!(config.eviction.write_back);
    }

    #[test]
    fn test_full_json() {
        let json = r#"{
            "project": "bock11",
            "compression": {"method": "deflate", "level": 4},
            "lock_name": "bock_lock",
            "eviction": {"upper_bound_percent": 80.0, "lower_bound_percent": 60.0, "batch_size": 10}
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.compression.method, CompressionMethod::Deflate);
        assert_eq!(config.lock_name, "bock_lock");
        assert_eq!(config.eviction.upper_bound_percent, 80.0);
        assert_eq!(config.eviction.interval_ms, 2000);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let json = r#"{"eviction": {"upper_bound_percent": 40.0, "lower_bound_percent": 60.0}}"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(SpatialDbError::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_names_rejected() {
        assert!(EngineConfig::new("a&b").validate().is_err());
        let mut config = EngineConfig::default();
        config.dirty_index_key = config.cache_index_key.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"project": "p1"}"#).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().project, "p1");
    }
}
