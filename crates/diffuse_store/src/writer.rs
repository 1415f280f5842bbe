//! Image writer contract and implementations.
//!
//! Generated images are stored under the destination directory, grouped
//! by day:
//! ```text
//! <dest>/
//! └── 2024-02-14/
//!     ├── 20240214-181502-0.png
//!     └── 20240214-181502-1.png
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// What a writer reports back after saving a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedImages {
    /// Decoded bytes of the first image
    pub primary_image: Option<Vec<u8>>,
    /// Path of the first image, empty when nothing was written
    pub primary_path: String,
    /// Every file written, in image order
    pub saved_paths: Vec<PathBuf>,
}

/// Turns backend image payloads into files.
#[async_trait]
pub trait ImageWriter: Send + Sync {
    async fn save_images(&self, images: &[String], destination: &Path) -> StoreResult<SavedImages>;
}

/// Decode one backend image, accepting an optional data-URL prefix.
pub fn decode_image(index: usize, encoded: &str) -> StoreResult<Vec<u8>> {
    let data = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };

    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| StoreError::Decode {
            index,
            message: e.to_string(),
        })
}

/// Writes PNG files to disk.
#[derive(Debug, Clone, Default)]
pub struct DiskImageWriter;

impl DiskImageWriter {
    pub fn new() -> Self {
        Self
    }

    /// Directory and file stem for a batch written at `now`.
    pub fn batch_location(destination: &Path, now: DateTime<Local>) -> (PathBuf, String) {
        let day_dir = destination.join(now.format("%Y-%m-%d").to_string());
        let stem = now.format("%Y%m%d-%H%M%S").to_string();
        (day_dir, stem)
    }

    /// Write `bytes` to a file that did not exist before, adding a `-N`
    /// suffix when `<stem>-<index>.png` is taken.
    async fn write_new(dir: &Path, stem: &str, index: usize, bytes: &[u8]) -> StoreResult<PathBuf> {
        let mut attempt = 0;
        loop {
            let path = if attempt == 0 {
                dir.join(format!("{}-{}.png", stem, index))
            } else {
                dir.join(format!("{}-{}-{}.png", stem, index, attempt))
            };

            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match opened {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    continue;
                }
                Err(source) => return Err(StoreError::Write { path, source }),
            };

            let written = async {
                file.write_all(bytes).await?;
                file.flush().await
            }
            .await;
            return match written {
                Ok(()) => Ok(path),
                Err(source) => Err(StoreError::Write { path, source }),
            };
        }
    }
}

#[async_trait]
impl ImageWriter for DiskImageWriter {
    async fn save_images(&self, images: &[String], destination: &Path) -> StoreResult<SavedImages> {
        if images.is_empty() {
            return Err(StoreError::Empty);
        }

        // Decode everything first so a bad payload leaves no partial batch.
        let decoded = images
            .iter()
            .enumerate()
            .map(|(i, img)| decode_image(i, img))
            .collect::<StoreResult<Vec<_>>>()?;

        let (dir, stem) = Self::batch_location(destination, Local::now());
        tokio::fs::create_dir_all(&dir).await?;

        let mut saved_paths = Vec::with_capacity(decoded.len());
        for (i, bytes) in decoded.iter().enumerate() {
            let path = Self::write_new(&dir, &stem, i, bytes).await?;
            debug!("Saved image {} ({} bytes)", path.display(), bytes.len());
            saved_paths.push(path);
        }

        info!("Saved {} image(s) to {}", saved_paths.len(), dir.display());

        Ok(SavedImages {
            primary_image: decoded.into_iter().next(),
            primary_path: saved_paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            saved_paths,
        })
    }
}

/// A call captured by [`RecordingWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSave {
    pub images: Vec<String>,
    pub destination: PathBuf,
}

/// Writer that records calls and writes nothing. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingWriter {
    calls: Arc<RwLock<Vec<RecordedSave>>>,
    failure: Arc<RwLock<Option<String>>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every save with this message.
    pub fn failing(self, message: impl Into<String>) -> Self {
        *self.failure.write() = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<RecordedSave> {
        self.calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }
}

#[async_trait]
impl ImageWriter for RecordingWriter {
    async fn save_images(&self, images: &[String], destination: &Path) -> StoreResult<SavedImages> {
        self.calls.write().push(RecordedSave {
            images: images.to_vec(),
            destination: destination.to_path_buf(),
        });

        if let Some(message) = self.failure.read().clone() {
            return Err(StoreError::Other(message));
        }

        let saved_paths: Vec<PathBuf> = (0..images.len())
            .map(|i| destination.join(format!("{}.png", i)))
            .collect();
        Ok(SavedImages {
            primary_image: None,
            primary_path: saved_paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            saved_paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_plain_and_data_url() {
        assert_eq!(decode_image(0, "aGVsbG8=").unwrap(), b"hello");
        assert_eq!(
            decode_image(0, "data:image/png;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_decode_error_names_index() {
        match decode_image(3, "***") {
            Err(StoreError::Decode { index, .. }) => assert_eq!(index, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_batch_location() {
        let now = Local.with_ymd_and_hms(2024, 2, 14, 18, 15, 2).unwrap();
        let (dir, stem) = DiskImageWriter::batch_location(Path::new("/out/txt2img"), now);

        assert_eq!(dir, PathBuf::from("/out/txt2img/2024-02-14"));
        assert_eq!(stem, "20240214-181502");
    }

    #[tokio::test]
    async fn test_write_new_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240214-181502-0.png"), b"first").unwrap();
        std::fs::write(dir.path().join("20240214-181502-0-1.png"), b"second").unwrap();

        let path = DiskImageWriter::write_new(dir.path(), "20240214-181502", 0, b"third")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("20240214-181502-0-2.png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"third");
        assert_eq!(std::fs::read(dir.path().join("20240214-181502-0.png")).unwrap(), b"first");
        assert_eq!(
            std::fs::read(dir.path().join("20240214-181502-0-1.png")).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_concurrent_writes_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let writes = (0..8u8).map(|n| {
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move { DiskImageWriter::write_new(&dir, "batch", 0, &[n]).await })
        });

        let mut paths = Vec::new();
        for write in writes.collect::<Vec<_>>() {
            paths.push(write.await.unwrap().unwrap());
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
    }

    #[tokio::test]
    async fn test_recording_writer() {
        let writer = RecordingWriter::new();
        let saved = writer
            .save_images(&["a".to_string()], Path::new("/out"))
            .await
            .unwrap();

        assert_eq!(saved.primary_path, "/out/0.png");
        assert_eq!(writer.call_count(), 1);
        assert_eq!(writer.calls()[0].images, vec!["a".to_string()]);

        let failing = RecordingWriter::new().failing("disk full");
        assert!(failing.save_images(&[], Path::new("/out")).await.is_err());
        assert_eq!(failing.call_count(), 1);
    }
}
