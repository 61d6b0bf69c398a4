use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfigError, EngineConfig};
use crate::core::duplicate::{self, DuplicateAggregator, DuplicateReport};
use crate::core::features::ExtractorFactory;
use crate::core::image::{ImageRef, ProcessResult};
use crate::core::pool::{BatchWorkerPool, PoolProgress};
use crate::core::scanner::{self, ScanError};

pub type SharedProgressCallback = Arc<dyn Fn(PoolProgress) + Send + Sync>;

/// Entry point of the duplicate detection engine.
///
/// Owns the extractor factory and configuration; every `find_*` call runs
/// the worker pool over its input and aggregates the results into a
/// [`DuplicateReport`].
pub struct DuplicateFinder<F> {
    factory: F,
    config: EngineConfig,
    progress: Option<SharedProgressCallback>,
}

impl<F: ExtractorFactory> DuplicateFinder<F> {
    pub fn new(factory: F, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            progress: None,
        })
    }

    pub fn with_progress_callback(mut self, callback: SharedProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Find duplicates among already decoded images.
    pub fn find_in_images(&self, images: Vec<ImageRef>) -> DuplicateReport {
        log::info!("Fingerprinting {} decoded image(s)", images.len());
        let results = self.pool().process(images);
        self.aggregate(results)
    }

    /// Find duplicates among image files. Each batch is decoded right before
    /// it is handed to the pool, so at most one batch of pixels is held in
    /// memory. Files that fail to decode are logged and skipped.
    pub fn find_in_paths(&self, paths: &[PathBuf]) -> DuplicateReport {
        log::info!("Fingerprinting {} image file(s)", paths.len());
        let pool = self.pool();
        let batches = paths
            .chunks(pool.batch_size())
            .map(scanner::load_images);
        let results = pool.process_batches(batches, paths.len());
        self.aggregate(results)
    }

    /// Scan `folders` for supported images and find duplicates among them.
    pub fn find_in_folders(&self, folders: &[PathBuf]) -> Result<DuplicateReport, ScanError> {
        let paths = scanner::discover_images(folders, &self.config.scan)?;
        Ok(self.find_in_paths(&paths))
    }

    fn pool(&self) -> BatchWorkerPool<'_, F> {
        let pool = BatchWorkerPool::new(&self.factory, &self.config);
        match &self.progress {
            Some(callback) => {
                let callback = Arc::clone(callback);
                pool.with_progress_callback(Box::new(move |p: PoolProgress| callback(p)))
            }
            None => pool,
        }
    }

    fn aggregate(&self, results: Vec<ProcessResult>) -> DuplicateReport {
        let mut aggregator = DuplicateAggregator::new(self.config.feature_matching);
        aggregator.extend(results);
        let report = aggregator.finish();

        log::info!(
            "Found {} hash group(s) and {} feature group(s) across {} image(s)",
            report.hash_groups.len(),
            report.feature_groups.len(),
            report.stats.images
        );
        if report.stats.hash_failures > 0 || report.stats.feature_failures > 0 {
            log::warn!(
                "{} image(s) could not be hashed, {} had no feature vector",
                report.stats.hash_failures,
                report.stats.feature_failures
            );
        }
        report
    }
}

/// Find hash and feature duplicates among `images`.
///
/// Never fails: per-image problems show up as missing fingerprints in the
/// report's stats rather than as errors.
pub fn find_duplicates<F: ExtractorFactory>(
    images: Vec<ImageRef>,
    factory: &F,
    config: &EngineConfig,
) -> DuplicateReport {
    let pool = BatchWorkerPool::new(factory, config);
    duplicate::aggregate(pool.process(images), config.feature_matching)
}
