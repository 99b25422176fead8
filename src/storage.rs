//! Output directory for finished images, served under `/images`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::Result;

/// URL prefix the output directory is mounted at.
pub const IMAGES_ROUTE: &str = "/images";

/// Where a saved image ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    /// `<uuid hex>.png`
    pub filename: String,
    /// `/images/<filename>`
    pub url: String,
    pub path: PathBuf,
}

/// Flat directory of generated PNGs.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    /// Open the store, creating the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "image store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write already-encoded PNG bytes under a fresh random name.
    pub async fn save_png(&self, png: &[u8]) -> Result<SavedImage> {
        let filename = format!("{}.png", Uuid::new_v4().as_simple());
        let path = self.dir.join(&filename);
        tokio::fs::write(&path, png).await?;
        tracing::info!(file = %filename, bytes = png.len(), "saved image");
        Ok(SavedImage {
            url: format!("{IMAGES_ROUTE}/{filename}"),
            filename,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_makes_nested_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("a/b/generated_images");
        let store = ImageStore::create(&dir).unwrap();
        assert!(store.dir().is_dir());
    }

    #[tokio::test]
    async fn test_save_png_names_and_url() {
        let root = tempfile::tempdir().unwrap();
        let store = ImageStore::create(root.path()).unwrap();

        let saved = store.save_png(b"\x89PNG fake").await.unwrap();
        let stem = saved.filename.strip_suffix(".png").unwrap();
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(saved.url, format!("/images/{}", saved.filename));
        assert_eq!(std::fs::read(&saved.path).unwrap(), b"\x89PNG fake");

        let other = store.save_png(b"x").await.unwrap();
        assert_ne!(saved.filename, other.filename);
    }
}
