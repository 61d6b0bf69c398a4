pub mod config;
pub mod core;
pub mod logging;
pub mod services;

pub use config::{ConfigError, EngineConfig, PoolLifetime};
pub use core::duplicate::{DuplicateGroup, DuplicateReport, FeatureMatching, ReportStats};
pub use core::features::{
    ColorHistogramFactory, ExtractError, ExtractorFactory, FeatureExtractor, FeatureVector,
};
pub use core::hash::{Fingerprint, FingerprintHasher, HashError};
pub use core::image::{ImageRef, ProcessResult};
pub use core::scanner::{LoadError, ScanError, ScanOptions};
pub use services::finder::{DuplicateFinder, find_duplicates};
