use image::{DynamicImage, ImageReader};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::image::ImageRef;

/// Extensions accepted by default, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "bmp", "gif"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Failed to read {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub recursive: bool,
    pub supported_formats: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            supported_formats: SUPPORTED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScanOptions {
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn is_supported_format(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.supported_formats.iter().any(|f| *f == ext))
    }
}

/// List the image files inside `folders`, in folder order and sorted by path
/// within each folder. Fails only if a folder is missing or unreadable.
pub fn discover_images(folders: &[PathBuf], options: &ScanOptions) -> Result<Vec<PathBuf>, ScanError> {
    let mut discovered = Vec::new();

    for root in folders {
        if !root.exists() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory {
                path: root.to_string_lossy().to_string(),
            });
        }

        let walker = if options.recursive {
            WalkDir::new(root)
        } else {
            WalkDir::new(root).max_depth(1)
        };

        for entry in walker.follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                // The root itself being unreadable is fatal; anything below it is skipped
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::Walk {
                        path: root.to_string_lossy().to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            if entry.file_type().is_file() && options.is_supported_format(entry.path()) {
                discovered.push(entry.into_path());
            }
        }
    }

    log::debug!("Discovered {} image file(s)", discovered.len());
    Ok(discovered)
}

/// Open and decode a single image, sniffing the format from its contents.
pub fn load_image(path: &Path) -> Result<DynamicImage, LoadError> {
    let reader = ImageReader::open(path)
        .map_err(|source| LoadError::Open {
            path: path.to_string_lossy().to_string(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| LoadError::Open {
            path: path.to_string_lossy().to_string(),
            source,
        })?;

    reader.decode().map_err(|source| LoadError::Decode {
        path: path.to_string_lossy().to_string(),
        source,
    })
}

/// Decode `paths` in parallel. Files that fail to decode are logged and
/// left out; the order of the survivors follows `paths`.
pub fn load_images(paths: &[PathBuf]) -> Vec<ImageRef> {
    paths
        .par_iter()
        .filter_map(|path| match load_image(path) {
            Ok(image) => Some(ImageRef::new(path.clone(), image)),
            Err(e) => {
                log::warn!("Could not open image: {}", e);
                None
            }
        })
        .collect()
}

/// Discover and decode every supported image in `folder`.
pub fn load_images_from_folder(folder: &Path, options: &ScanOptions) -> Result<Vec<ImageRef>, ScanError> {
    let paths = discover_images(&[folder.to_path_buf()], options)?;
    Ok(load_images(&paths))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn create_test_image(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        img.save(path).unwrap();
    }

    #[test]
    fn test_load_images_from_folder() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("img1.jpg"), 10, 10, [0, 0, 0]);
        create_test_image(&temp_dir.path().join("img2.png"), 10, 10, [0, 0, 0]);

        let images = load_images_from_folder(temp_dir.path(), &ScanOptions::default()).unwrap();

        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|i| i.path.ends_with("img1.jpg")));
        assert!(images.iter().any(|i| i.path.ends_with("img2.png")));
    }

    #[test]
    fn test_file_type_filtering() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("a.PNG"), 4, 4, [1, 2, 3]);
        create_test_image(&temp_dir.path().join("b.bmp"), 4, 4, [1, 2, 3]);
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]))
            .save_with_format(temp_dir.path().join("c.tiff"), ImageFormat::Tiff)
            .unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"text content").unwrap();

        let paths = discover_images(&[temp_dir.path().to_path_buf()], &ScanOptions::default()).unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.PNG"));
        assert!(paths[1].ends_with("b.bmp"));
    }

    #[test]
    fn test_supported_format_detection() {
        let options = ScanOptions::default();

        assert!(options.is_supported_format(Path::new("test.jpg")));
        assert!(options.is_supported_format(Path::new("test.JPEG")));
        assert!(options.is_supported_format(Path::new("test.gif")));
        assert!(!options.is_supported_format(Path::new("test.tiff")));
        assert!(!options.is_supported_format(Path::new("test.txt")));
        assert!(!options.is_supported_format(Path::new("test")));
    }

    #[test]
    fn test_recursive_scan() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        create_test_image(&temp_dir.path().join("top.png"), 4, 4, [0, 0, 0]);
        create_test_image(&nested.join("inner.png"), 4, 4, [0, 0, 0]);

        let roots = [temp_dir.path().to_path_buf()];
        let flat = discover_images(&roots, &ScanOptions::default()).unwrap();
        let deep = discover_images(&roots, &ScanOptions::default().recursive(true)).unwrap();

        assert_eq!(flat.len(), 1);
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn test_corrupt_image_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("good.png"), 10, 10, [5, 5, 5]);
        fs::write(temp_dir.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();

        let images = load_images_from_folder(temp_dir.path(), &ScanOptions::default()).unwrap();

        assert_eq!(images.len(), 1);
        assert!(images[0].path.ends_with("good.png"));
    }

    #[test]
    fn test_empty_folder() {
        let temp_dir = TempDir::new().unwrap();
        let images = load_images_from_folder(temp_dir.path(), &ScanOptions::default()).unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("does-not-exist");

        let result = discover_images(&[missing], &ScanOptions::default());
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_file_instead_of_folder_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("img.png");
        create_test_image(&file, 4, 4, [0, 0, 0]);

        let result = discover_images(&[file], &ScanOptions::default());
        assert!(matches!(result, Err(ScanError::NotADirectory { .. })));
    }

    #[test]
    fn test_load_image_reports_decode_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.png");
        fs::write(&path, b"\x89PNG\r\n\x1a\nnope").unwrap();

        assert!(matches!(load_image(&path), Err(LoadError::Decode { .. })));
    }
}
