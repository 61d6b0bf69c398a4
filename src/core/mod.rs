// Duplicate detection engine building blocks:
// - image loading and the per-image data model
// - average-hash fingerprints and feature extraction
// - the batch worker pool and the duplicate aggregator

pub mod duplicate;
pub mod features;
pub mod hash;
pub mod image;
pub mod pool;
pub mod scanner;
