//! Filesystem access behind a trait, so tests can simulate locked or vanishing files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Not every platform reports a creation time
    pub created: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata>;

    /// Whether the file can be opened without another process holding it.
    async fn try_open_exclusive(&self, path: &Path) -> bool;

    /// A stable key for `path`; the tracker stores fingerprints under it.
    async fn canonicalize(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

/// The real disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(FileMetadata {
            size: meta.len(),
            modified: meta.modified()?.into(),
            created: meta.created().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn try_open_exclusive(&self, path: &Path) -> bool {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || open_exclusive(&path).is_ok())
            .await
            .unwrap_or(false)
    }

    async fn canonicalize(&self, path: &Path) -> PathBuf {
        match tokio::fs::canonicalize(path).await {
            Ok(canonical) => canonical,
            Err(_) => path.to_path_buf(),
        }
    }
}

// Office applications hold an exclusive share lock while a document is open.
#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<std::fs::File> {
    use std::os::windows::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(path)
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> io::Result<std::fs::File> {
    std::fs::File::open(path)
}
