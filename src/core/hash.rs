use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Side length of the grid the image is reduced to before hashing.
pub const HASH_GRID: u32 = 8;

const HASH_BITS: usize = (HASH_GRID * HASH_GRID) as usize;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Invalid fingerprint string: {0}")]
    Parse(String),
}

/// 64-bit average hash. Two images are hash duplicates iff their
/// fingerprints are bitwise equal.
///
/// Grid cell `i` (raster order) lives in bit `63 - i`, so the hex form reads
/// row by row from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Number of differing bits. Only used for diagnostics; grouping is
    /// always exact.
    pub fn hamming_distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(HashError::Parse(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Fingerprint)
            .map_err(|_| HashError::Parse(s.to_string()))
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Computes average-hash fingerprints.
///
/// The image is converted to grayscale and shrunk to an 8x8 grid; every cell
/// at or above the grid's mean intensity becomes a set bit. The mean is
/// exact, not rounded to an intensity level, so a single brighter cell on an
/// otherwise flat grid still stands out.
#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    filter: FilterType,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }

    /// Compute the fingerprint of a decoded image
    pub fn fingerprint(&self, image: &DynamicImage) -> Result<Fingerprint, HashError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(HashError::EmptyImage { width, height });
        }

        let grid = self.grid(image);
        Ok(Fingerprint(pack_bits(grid.as_raw())))
    }

    fn grid(&self, image: &DynamicImage) -> GrayImage {
        let gray = image.to_luma8();
        if gray.dimensions() == (HASH_GRID, HASH_GRID) {
            return gray;
        }
        imageops::resize(&gray, HASH_GRID, HASH_GRID, self.filter)
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Threshold each cell against the grid mean, first cell in the top bit.
fn pack_bits(cells: &[u8]) -> u64 {
    debug_assert_eq!(cells.len(), HASH_BITS);
    let sum: u32 = cells.iter().map(|&c| u32::from(c)).sum();
    let mean = sum as f32 / cells.len() as f32;

    cells.iter().fold(0u64, |bits, &cell| {
        (bits << 1) | u64::from(f32::from(cell) >= mean)
    })
}
