//! Checkpoint discovery.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};

/// File extensions recognised as checkpoints.
pub const CHECKPOINT_EXTENSIONS: &[&str] = &["safetensors", "ckpt"];

/// A checkpoint file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelFile {
    /// File name, as the backend expects it in `sd_model_checkpoint`
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Checkpoints available in a models directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelFile>,
}

impl ModelCatalog {
    /// List checkpoint files directly inside `dir`, sorted by name.
    pub fn scan(dir: &Path) -> CoreResult<Self> {
        if !dir.is_dir() {
            return Err(CoreError::Catalog(format!(
                "models directory not found: {}",
                dir.display()
            )));
        }

        let mut models: Vec<ModelFile> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        CHECKPOINT_EXTENSIONS
                            .iter()
                            .any(|known| ext.eq_ignore_ascii_case(known))
                    })
                    .unwrap_or(false)
            })
            .map(|e| ModelFile {
                name: e.file_name().to_string_lossy().into_owned(),
                size_bytes: e.metadata().map(|m| m.len()).unwrap_or(0),
                path: e.into_path(),
            })
            .collect();

        models.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} checkpoint(s) in {}", models.len(), dir.display());

        Ok(Self { models })
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&ModelFile> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v1-5-pruned-emaonly.safetensors"), b"abc").unwrap();
        std::fs::write(dir.path().join("anything-v3.CKPT"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested.safetensors")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("deep.safetensors"), b"").unwrap();

        let catalog = ModelCatalog::scan(dir.path()).unwrap();
        assert_eq!(
            catalog.names(),
            vec!["anything-v3.CKPT", "v1-5-pruned-emaonly.safetensors"]
        );
        assert_eq!(
            catalog.find("v1-5-pruned-emaonly.safetensors").unwrap().size_bytes,
            3
        );
        assert!(catalog.find("deep.safetensors").is_none());
    }

    #[test]
    fn test_scan_missing_dir() {
        let err = ModelCatalog::scan(Path::new("/definitely/not/models")).unwrap_err();
        assert!(matches!(err, CoreError::Catalog(_)));
    }
}
