use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core::duplicate::FeatureMatching;
use crate::core::scanner::ScanOptions;

pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("Worker count must be at least 1")]
    ZeroWorkers,

    #[error("Similarity threshold must be within [-1, 1], got {0}")]
    InvalidSimilarity(f32),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// How long worker threads, and the extractor each one owns, stay alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLifetime {
    /// One pool for the whole run; batches only bound how many decoded
    /// images are in flight.
    #[default]
    Run,
    /// A fresh pool, with freshly built extractors, for every batch.
    PerBatch,
}

/// Tunables of the duplicate detection engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    /// `None` means one worker per available CPU.
    pub workers: Option<usize>,
    pub pool_lifetime: PoolLifetime,
    pub feature_matching: FeatureMatching,
    pub scan: ScanOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: None,
            pool_lifetime: PoolLifetime::default(),
            feature_matching: FeatureMatching::default(),
            scan: ScanOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.workers == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        if let FeatureMatching::Cosine { min_similarity } = self.feature_matching {
            if !(-1.0..=1.0).contains(&min_similarity) {
                return Err(ConfigError::InvalidSimilarity(min_similarity));
            }
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.batch_size, 64);
        assert_eq!(config.pool_lifetime, PoolLifetime::Run);
        assert_eq!(config.feature_matching, FeatureMatching::Exact);
        assert!(config.worker_count() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroBatchSize)));

        let config = EngineConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));

        let config = EngineConfig {
            feature_matching: FeatureMatching::Cosine {
                min_similarity: f32::NAN,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSimilarity(_))
        ));
    }

    #[test]
    fn test_partial_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "batch_size": 16, "pool_lifetime": "per_batch", "scan": { "recursive": true } }"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();

        assert_eq!(config.batch_size, 16);
        assert_eq!(config.pool_lifetime, PoolLifetime::PerBatch);
        assert!(config.scan.recursive);
        assert_eq!(config.scan.supported_formats.len(), 5);
        assert_eq!(config.workers, None);
    }

    #[test]
    fn test_cosine_matching_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "feature_matching": { "mode": "cosine", "min_similarity": 0.95 } }"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(
            config.feature_matching,
            FeatureMatching::Cosine {
                min_similarity: 0.95
            }
        );
    }

    #[test]
    fn test_invalid_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            EngineConfig::from_file(&temp_dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
