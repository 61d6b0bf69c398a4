use image::{DynamicImage, GenericImageView, imageops::FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the square input most embedding models expect.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// Histogram bins per color channel for the built-in extractor.
pub const DEFAULT_BINS_PER_CHANNEL: usize = 8;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Extractor initialization failed: {message}")]
    Init { message: String },

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Model returned {actual} values, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Model returned a non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("Feature extraction failed: {message}")]
    Failed { message: String },
}

/// Fixed-length embedding of an image. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

/// Hashable stand-in for a feature vector: the bit pattern of every
/// component, with `-0.0` folded onto `0.0` so that value-equal vectors
/// share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureKey(Vec<u32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self) -> FeatureKey {
        FeatureKey(
            self.0
                .iter()
                .map(|&v| if v == 0.0 { 0.0f32.to_bits() } else { v.to_bits() })
                .collect(),
        )
    }

    /// Cosine similarity in `[-1, 1]`, or `None` when the lengths differ or
    /// either vector has zero norm.
    pub fn cosine_similarity(&self, other: &FeatureVector) -> Option<f32> {
        if self.len() != other.len() {
            return None;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.0.iter().zip(&other.0) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return None;
        }
        Some((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Image resized to the model's input shape, RGB samples in `[0, 1]`,
/// row-major with interleaved channels.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ModelInput {
    pub fn from_image(image: &DynamicImage, width: u32, height: u32) -> Self {
        let resized = image
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgb8();
        let data = resized.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn pixels(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(3)
    }
}

/// An embedding model. Instances are owned by a single worker and may keep
/// mutable scratch state between calls.
pub trait FeatureExtractor {
    /// Input shape the model expects, as (width, height).
    fn input_size(&self) -> (u32, u32) {
        (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
    }

    /// Length of every vector this extractor returns.
    fn dimension(&self) -> usize;

    fn extract(&mut self, input: &ModelInput) -> Result<Vec<f32>, ExtractError>;
}

/// Builds extractor instances. Called once per worker when the worker
/// starts, never per image.
pub trait ExtractorFactory: Sync {
    type Extractor: FeatureExtractor;

    fn build(&self) -> Result<Self::Extractor, ExtractError>;
}

impl<F, E> ExtractorFactory for F
where
    F: Fn() -> Result<E, ExtractError> + Sync,
    E: FeatureExtractor,
{
    type Extractor = E;

    fn build(&self) -> Result<E, ExtractError> {
        self()
    }
}

/// Uniform per-image front end for an extractor: prepares the model input
/// and validates what comes back.
pub struct FeatureAdapter<E> {
    extractor: E,
}

impl<E: FeatureExtractor> FeatureAdapter<E> {
    pub fn new(extractor: E) -> Self {
        Self { extractor }
    }

    pub fn dimension(&self) -> usize {
        self.extractor.dimension()
    }

    pub fn extract(&mut self, image: &DynamicImage) -> Result<FeatureVector, ExtractError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ExtractError::EmptyImage { width, height });
        }

        let (input_width, input_height) = self.extractor.input_size();
        let input = ModelInput::from_image(image, input_width, input_height);
        let values = self.extractor.extract(&input)?;

        let expected = self.extractor.dimension();
        if values.len() != expected {
            return Err(ExtractError::DimensionMismatch {
                expected,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ExtractError::NonFinite { index });
        }

        Ok(FeatureVector::new(values))
    }
}

/// Built-in deterministic extractor: a joint RGB histogram of the model
/// input, L1-normalized. With 8 bins per channel it yields 512 values.
#[derive(Debug, Clone)]
pub struct ColorHistogramExtractor {
    bins_per_channel: usize,
    input_size: u32,
    counts: Vec<u32>,
}

impl ColorHistogramExtractor {
    pub fn new(bins_per_channel: usize, input_size: u32) -> Result<Self, ExtractError> {
        if bins_per_channel == 0 || input_size == 0 {
            return Err(ExtractError::Init {
                message: format!(
                    "invalid histogram shape: {bins_per_channel} bins, {input_size}px input"
                ),
            });
        }
        Ok(Self {
            bins_per_channel,
            input_size,
            counts: vec![0; bins_per_channel.pow(3)],
        })
    }

    fn bin(&self, value: f32) -> usize {
        ((value * self.bins_per_channel as f32) as usize).min(self.bins_per_channel - 1)
    }
}

impl FeatureExtractor for ColorHistogramExtractor {
    fn input_size(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    fn dimension(&self) -> usize {
        self.counts.len()
    }

    fn extract(&mut self, input: &ModelInput) -> Result<Vec<f32>, ExtractError> {
        self.counts.iter_mut().for_each(|c| *c = 0);

        let bins = self.bins_per_channel;
        let mut total = 0u32;
        for px in input.pixels() {
            let idx = (self.bin(px[0]) * bins + self.bin(px[1])) * bins + self.bin(px[2]);
            self.counts[idx] += 1;
            total += 1;
        }
        if total == 0 {
            return Err(ExtractError::Failed {
                message: "model input has no pixels".to_string(),
            });
        }

        Ok(self
            .counts
            .iter()
            .map(|&c| c as f32 / total as f32)
            .collect())
    }
}

/// Factory for [`ColorHistogramExtractor`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ColorHistogramFactory {
    pub bins_per_channel: usize,
    pub input_size: u32,
}

impl Default for ColorHistogramFactory {
    fn default() -> Self {
        Self {
            bins_per_channel: DEFAULT_BINS_PER_CHANNEL,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl ExtractorFactory for ColorHistogramFactory {
    type Extractor = ColorHistogramExtractor;

    fn build(&self) -> Result<ColorHistogramExtractor, ExtractError> {
        ColorHistogramExtractor::new(self.bins_per_channel, self.input_size)
    }
}
