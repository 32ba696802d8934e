//! Permit document storage.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum FileSystemError {
    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Keys must be relative paths that stay inside the storage root
    #[error("invalid storage path: {path}")]
    InvalidPath { path: String },
}

impl FileSystemError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        let path = path.display().to_string();
        if source.kind() == ErrorKind::NotFound {
            FileSystemError::NotFound { path }
        } else {
            FileSystemError::Io { path, source }
        }
    }
}

pub type Result<T> = std::result::Result<T, FileSystemError>;

/// `Ok(false)` when the path does not exist; any other failure is returned.
pub async fn file_exists(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FileSystemError::Io {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Where generated permits are kept. Keys are relative, `/`-separated paths.
#[async_trait]
pub trait PermitStorage: Send + Sync {
    async fn store(&self, key: &str, contents: &[u8]) -> Result<()>;

    async fn retrieve(&self, key: &str) -> Result<Vec<u8>>;

    /// Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Stores permits under a directory on local disk.
#[derive(Debug, Clone)]
pub struct LocalPermitStorage {
    root: PathBuf,
}

impl LocalPermitStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty() && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(FileSystemError::InvalidPath { path: key.to_string() });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PermitStorage for LocalPermitStorage {
    #[instrument(skip(self, contents), fields(bytes = contents.len()), err)]
    async fn store(&self, key: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileSystemError::from_io(parent, e))?;
        }

        // Write then rename so readers never see a partial document
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, contents)
            .await
            .map_err(|e| FileSystemError::from_io(&partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| FileSystemError::from_io(&path, e))?;

        debug!(path = %path.display(), "Stored permit document");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn retrieve(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| FileSystemError::from_io(&path, e))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FileSystemError::from_io(&path, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        file_exists(&self.resolve(key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_exists_reports_missing_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.pdf");
        tokio::fs::write(&present, b"%PDF").await.unwrap();

        assert!(file_exists(&present).await.unwrap());
        assert!(!file_exists(&dir.path().join("missing.pdf")).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_exists_propagates_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        tokio::fs::write(&file, b"x").await.unwrap();

        // A path through a regular file fails with NotADirectory, not NotFound
        let err = file_exists(&file.join("child.pdf")).await.unwrap_err();
        assert!(matches!(err, FileSystemError::Io { .. }));
    }

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalPermitStorage::new(dir.path());

        storage.store("2025/03/PD-001000.pdf", b"%PDF-1.4").await.unwrap();
        assert!(storage.exists("2025/03/PD-001000.pdf").await.unwrap());
        assert_eq!(storage.retrieve("2025/03/PD-001000.pdf").await.unwrap(), b"%PDF-1.4");

        assert!(storage.delete("2025/03/PD-001000.pdf").await.unwrap());
        assert!(!storage.delete("2025/03/PD-001000.pdf").await.unwrap());
        assert!(!storage.exists("2025/03/PD-001000.pdf").await.unwrap());

        let err = storage.retrieve("2025/03/PD-001000.pdf").await.unwrap_err();
        assert!(matches!(err, FileSystemError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalPermitStorage::new(dir.path());

        for key in ["../secret.pdf", "/etc/passwd", "", "a/../../b.pdf"] {
            let err = storage.store(key, b"x").await.unwrap_err();
            assert!(matches!(err, FileSystemError::InvalidPath { .. }), "{key}");
        }
    }
}
