use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::features::FeatureVector;
use crate::core::hash::Fingerprint;

/// A decoded image together with the file it came from.
///
/// The pixel buffer is moved into whichever worker processes the image and
/// dropped once both fingerprints are derived.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub path: PathBuf,
    pub image: DynamicImage,
}

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>, image: DynamicImage) -> Self {
        Self {
            path: path.into(),
            image,
        }
    }
}

/// Outcome of fingerprinting one image. A `None` field means that stage
/// failed for this image and it is left out of that stage's grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub path: PathBuf,
    pub fingerprint: Option<Fingerprint>,
    pub features: Option<FeatureVector>,
}

impl ProcessResult {
    pub fn new(
        path: PathBuf,
        fingerprint: Option<Fingerprint>,
        features: Option<FeatureVector>,
    ) -> Self {
        Self {
            path,
            fingerprint,
            features,
        }
    }

    /// Result for an image where neither stage produced anything.
    pub fn failed(path: PathBuf) -> Self {
        Self::new(path, None, None)
    }

    pub fn is_complete(&self) -> bool {
        self.fingerprint.is_some() && self.features.is_some()
    }
}
