//! Image byte storage behind an opaque path handle.
//!
//! The pipeline never interprets the handle beyond passing it back to
//! the repository; actual byte storage is an external collaborator.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("image `{path}` not found")]
    NotFound { path: String },
    #[error("invalid image path `{path}` (empty, absolute or traversing)")]
    InvalidPath { path: String },
    #[error("failed to access image `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn load(&self, path: &str) -> Result<Vec<u8>, ImageStoreError>;

    async fn save(&self, path: &str, bytes: &[u8]) -> Result<(), ImageStoreError>;

    /// Remove is idempotent; removing a missing image is not an error so
    /// failure cleanup can never wedge on a half-written record.
    async fn remove(&self, path: &str) -> Result<(), ImageStoreError>;
}

/// Filesystem-backed repository rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FsImageRepository {
    root: PathBuf,
}

impl FsImageRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ImageStoreError> {
        let relative = Path::new(path);
        let valid = !path.trim().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(ImageStoreError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageRepository for FsImageRepository {
    async fn load(&self, path: &str) -> Result<Vec<u8>, ImageStoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageStoreError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(source) => Err(ImageStoreError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn save(&self, path: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ImageStoreError::Io {
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|source| ImageStoreError::Io {
                path: path.to_string(),
                source,
            })
    }

    async fn remove(&self, path: &str) -> Result<(), ImageStoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ImageStoreError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }
}

/// In-memory repository used by tests and the one-shot CLI.
#[derive(Debug, Default)]
pub struct MemoryImageRepository {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn load(&self, path: &str) -> Result<Vec<u8>, ImageStoreError> {
        let blobs = self.blobs.lock().expect("image table poisoned");
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| ImageStoreError::NotFound {
                path: path.to_string(),
            })
    }

    async fn save(&self, path: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        if path.trim().is_empty() {
            return Err(ImageStoreError::InvalidPath {
                path: path.to_string(),
            });
        }
        let mut blobs = self.blobs.lock().expect("image table poisoned");
        blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), ImageStoreError> {
        let mut blobs = self.blobs.lock().expect("image table poisoned");
        blobs.remove(path);
        Ok(())
    }
}

/// Deterministic in-memory test image: a small solid-color PNG.
#[cfg(test)]
pub(crate) fn test_image_bytes() -> Vec<u8> {
    let pixels = image::RgbImage::from_pixel(4, 4, image::Rgb([96, 160, 64]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(pixels)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .expect("encode test image");
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_round_trip_and_idempotent_remove() {
        let repo = MemoryImageRepository::default();
        repo.save("images/1.png", &[1, 2, 3]).await.expect("save");
        assert_eq!(repo.load("images/1.png").await.expect("load"), vec![1, 2, 3]);

        repo.remove("images/1.png").await.expect("remove");
        repo.remove("images/1.png").await.expect("second remove");
        assert!(matches!(
            repo.load("images/1.png").await,
            Err(ImageStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fs_round_trip_under_root() {
        let temp = TempDir::new().expect("temp dir");
        let repo = FsImageRepository::new(temp.path());

        repo.save("crops/42.jpg", b"jpeg bytes").await.expect("save");
        assert_eq!(
            repo.load("crops/42.jpg").await.expect("load"),
            b"jpeg bytes".to_vec()
        );

        repo.remove("crops/42.jpg").await.expect("remove");
        assert!(matches!(
            repo.load("crops/42.jpg").await,
            Err(ImageStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fs_rejects_traversal_and_empty_paths() {
        let temp = TempDir::new().expect("temp dir");
        let repo = FsImageRepository::new(temp.path());

        for bad in ["../outside.jpg", "/etc/passwd", ""] {
            assert!(
                matches!(
                    repo.load(bad).await,
                    Err(ImageStoreError::InvalidPath { .. })
                ),
                "path `{bad}` must be rejected"
            );
        }
    }
}
