//! Fingerprint store deciding which files need (re-)indexing.
//!
//! One row per absolute file path records the whole-file content hash, the
//! modification time seen when it was indexed, and the outcome. The check is
//! two-stage so unchanged files are never read:
//!
//! 1. modification time not newer than the stored one: unchanged
//! 2. otherwise hash the bytes (blake3) and compare with the stored hash
//!
//! Files whose last run ended `pending` or `failed` are always re-indexed.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE indexed_files (
//!     file_path TEXT PRIMARY KEY,
//!     content_hash TEXT NOT NULL,        -- blake3, lowercase hex
//!     last_modified_ns INTEGER NOT NULL, -- file mtime, nanoseconds since the epoch
//!     last_indexed TEXT NOT NULL,
//!     unit_count INTEGER NOT NULL,
//!     units_failed INTEGER NOT NULL,
//!     status TEXT NOT NULL,              -- pending | indexed | partial | failed
//!     target_collection TEXT NOT NULL,   -- comma-separated collection names
//!     last_error TEXT
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::Result;
use crate::fs::Filesystem;

/// Outcome of the last indexing run of a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Indexed,
    Partial,
    Failed,
}

impl FileStatus {
    pub const ALL: [FileStatus; 4] = [
        FileStatus::Pending,
        FileStatus::Indexed,
        FileStatus::Partial,
        FileStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Indexed => "indexed",
            FileStatus::Partial => "partial",
            FileStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(FileStatus::Pending),
            "indexed" => Ok(FileStatus::Indexed),
            "partial" => Ok(FileStatus::Partial),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(format!(
                "Invalid file status: {s}. Valid options: pending, indexed, partial, failed"
            )),
        }
    }
}

/// What the tracker remembers about one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub last_indexed: DateTime<Utc>,
    pub unit_count: usize,
    pub units_failed: usize,
    pub status: FileStatus,
    /// Comma-separated names of the collections the file's units went to
    pub target_collection: String,
    pub last_error: Option<String>,
}

impl FileFingerprint {
    pub fn collections(&self) -> Vec<&str> {
        self.target_collection
            .split(',')
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// blake3 of the whole file, lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub struct ChangeTracker {
    pool: SqlitePool,
    fs: Arc<dyn Filesystem>,
    path_locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl ChangeTracker {
    /// Opens (creating if needed) the tracker database at `db_path`.
    pub async fn open(db_path: &Path, fs: Arc<dyn Filesystem>) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| crate::error::IndexError::io(parent, e))?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true),
        )
        .await?;

        let tracker = Self::from_pool(pool, fs);
        tracker.create_tables().await?;
        tracing::debug!(db = %db_path.display(), "Opened change tracker");
        Ok(tracker)
    }

    /// In-memory tracker for tests. A single connection that is never
    /// recycled, since every SQLite memory connection is its own database.
    pub async fn open_memory(fs: Arc<dyn Filesystem>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        let tracker = Self::from_pool(pool, fs);
        tracker.create_tables().await?;
        Ok(tracker)
    }

    fn from_pool(pool: SqlitePool, fs: Arc<dyn Filesystem>) -> Self {
        Self {
            pool,
            fs,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indexed_files (
                file_path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                last_modified_ns INTEGER NOT NULL,
                last_indexed TEXT NOT NULL,
                unit_count INTEGER NOT NULL DEFAULT 0,
                units_failed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                target_collection TEXT NOT NULL DEFAULT '',
                last_error TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_indexed_files_status ON indexed_files(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_indexed_files_modified ON indexed_files(last_modified_ns)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Serializes work on one path. Hold the guard for the whole
    /// check-extract-embed-write-record sequence.
    pub async fn lock_path(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .path_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, path: &Path) -> Result<Option<FileFingerprint>> {
        let row = sqlx::query("SELECT * FROM indexed_files WHERE file_path = ?")
            .bind(path.to_string_lossy().into_owned())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| fingerprint_from_row(&row)).transpose()
    }

    /// Whether `path` must be (re-)indexed, plus the prior fingerprint if any.
    pub async fn needs_indexing(&self, path: &Path) -> Result<(bool, Option<FileFingerprint>)> {
        let Some(prior) = self.get(path).await? else {
            return Ok((true, None));
        };
        if matches!(prior.status, FileStatus::Pending | FileStatus::Failed) {
            return Ok((true, Some(prior)));
        }

        let metadata = match self.fs.metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::debug!(path = %path.display(), "Cannot stat tracked file: {err}");
                return Ok((true, Some(prior)));
            }
        };
        if metadata.modified <= prior.last_modified {
            return Ok((false, Some(prior)));
        }

        let bytes = match self.fs.read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(path = %path.display(), "Cannot read tracked file: {err}");
                return Ok((true, Some(prior)));
            }
        };
        if hash_bytes(&bytes) != prior.content_hash {
            return Ok((true, Some(prior)));
        }

        // Touched but identical: remember the new mtime so the next pass skips hashing
        tracing::debug!(path = %path.display(), "Modification time changed, content did not");
        sqlx::query("UPDATE indexed_files SET last_modified_ns = ? WHERE file_path = ?")
            .bind(to_nanos(metadata.modified))
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok((false, Some(prior)))
    }

    /// Atomically replaces the fingerprint for `fingerprint.path`.
    pub async fn record_result(&self, fingerprint: &FileFingerprint) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexed_files (
                file_path, content_hash, last_modified_ns, last_indexed, unit_count,
                units_failed, status, target_collection, last_error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                last_modified_ns = excluded.last_modified_ns,
                last_indexed = excluded.last_indexed,
                unit_count = excluded.unit_count,
                units_failed = excluded.units_failed,
                status = excluded.status,
                target_collection = excluded.target_collection,
                last_error = excluded.last_error",
        )
        .bind(fingerprint.path.to_string_lossy().into_owned())
        .bind(&fingerprint.content_hash)
        .bind(to_nanos(fingerprint.last_modified))
        .bind(fingerprint.last_indexed)
        .bind(fingerprint.unit_count as i64)
        .bind(fingerprint.units_failed as i64)
        .bind(fingerprint.status.as_str())
        .bind(&fingerprint.target_collection)
        .bind(&fingerprint.last_error)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            path = %fingerprint.path.display(),
            status = %fingerprint.status,
            units = fingerprint.unit_count,
            "Recorded fingerprint"
        );
        Ok(())
    }

    pub async fn list_by_status(&self, status: FileStatus) -> Result<Vec<FileFingerprint>> {
        let rows = sqlx::query("SELECT * FROM indexed_files WHERE status = ? ORDER BY file_path")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fingerprint_from_row).collect()
    }

    /// Most recently indexed files first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<FileFingerprint>> {
        let rows = sqlx::query("SELECT * FROM indexed_files ORDER BY last_indexed DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fingerprint_from_row).collect()
    }

    /// Tracked file counts, with every status present (zero if unused).
    pub async fn counts_by_status(&self) -> Result<BTreeMap<FileStatus, usize>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM indexed_files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: BTreeMap<FileStatus, usize> =
            FileStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<FileStatus>() {
                Ok(status) => {
                    counts.insert(status, n as usize);
                }
                Err(err) => tracing::warn!("Ignoring tracker rows: {err}"),
            }
        }
        Ok(counts)
    }

    /// Forgets `path`. Returns whether a fingerprint existed.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM indexed_files WHERE file_path = ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn fingerprint_from_row(row: &SqliteRow) -> Result<FileFingerprint> {
    let path: String = row.try_get("file_path")?;
    let status: String = row.try_get("status")?;
    let status = status.parse::<FileStatus>().map_err(|message| {
        sqlx::Error::Decode(message.into())
    })?;
    let unit_count: i64 = row.try_get("unit_count")?;
    let units_failed: i64 = row.try_get("units_failed")?;

    Ok(FileFingerprint {
        path: PathBuf::from(path),
        content_hash: row.try_get("content_hash")?,
        last_modified: DateTime::from_timestamp_nanos(row.try_get("last_modified_ns")?),
        last_indexed: row.try_get("last_indexed")?,
        unit_count: unit_count.max(0) as usize,
        units_failed: units_failed.max(0) as usize,
        status,
        target_collection: row.try_get("target_collection")?,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFilesystem;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    async fn tracker() -> ChangeTracker {
        ChangeTracker::open_memory(Arc::new(LocalFilesystem)).await.unwrap()
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    async fn record_indexed(tracker: &ChangeTracker, path: &Path) -> FileFingerprint {
        let bytes = std::fs::read(path).unwrap();
        let modified = std::fs::metadata(path).unwrap().modified().unwrap();
        let fingerprint = FileFingerprint {
            path: path.to_path_buf(),
            content_hash: hash_bytes(&bytes),
            last_modified: modified.into(),
            last_indexed: Utc::now(),
            unit_count: 3,
            units_failed: 0,
            status: FileStatus::Indexed,
            target_collection: "documents".to_string(),
            last_error: None,
        };
        tracker.record_result(&fingerprint).await.unwrap();
        fingerprint
    }

    #[tokio::test]
    async fn test_unknown_file_needs_indexing() {
        let tracker = tracker().await;
        let (needed, prior) = tracker.needs_indexing(Path::new("/nowhere.txt")).await.unwrap();
        assert!(needed);
        assert!(prior.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_and_touched_files_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "Alpha beta gamma.").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        let tracker = tracker().await;
        let stored = record_indexed(&tracker, &path).await;
        let (needed, prior) = tracker.needs_indexing(&path).await.unwrap();
        assert!(!needed);
        assert_eq!(prior.unwrap(), stored);

        // Newer mtime, same bytes
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100));
        let (needed, _) = tracker.needs_indexing(&path).await.unwrap();
        assert!(!needed);
        let refreshed = tracker.get(&path).await.unwrap().unwrap();
        assert!(refreshed.last_modified > stored.last_modified);
    }

    #[tokio::test]
    async fn test_changed_content_needs_indexing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "Alpha beta gamma.").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        let tracker = tracker().await;
        record_indexed(&tracker, &path).await;

        std::fs::write(&path, "Alpha beta delta.").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_200));
        let (needed, prior) = tracker.needs_indexing(&path).await.unwrap();
        assert!(needed);
        assert_eq!(prior.unwrap().status, FileStatus::Indexed);
    }

    #[tokio::test]
    async fn test_failed_and_pending_are_retried_partial_is_not() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "Alpha beta gamma.").unwrap();

        let tracker = tracker().await;
        let mut fingerprint = record_indexed(&tracker, &path).await;

        for (status, expected) in [
            (FileStatus::Failed, true),
            (FileStatus::Pending, true),
            (FileStatus::Partial, false),
        ] {
            fingerprint.status = status;
            tracker.record_result(&fingerprint).await.unwrap();
            let (needed, _) = tracker.needs_indexing(&path).await.unwrap();
            assert_eq!(needed, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_record_result_replaces_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "Alpha beta gamma.").unwrap();

        let tracker = tracker().await;
        let mut fingerprint = record_indexed(&tracker, &path).await;
        fingerprint.status = FileStatus::Partial;
        fingerprint.units_failed = 1;
        fingerprint.target_collection = "structured_rows,structured_summaries".to_string();
        fingerprint.last_error = Some("write failed".to_string());
        tracker.record_result(&fingerprint).await.unwrap();

        let stored = tracker.get(&path).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Partial);
        assert_eq!(stored.units_failed, 1);
        assert_eq!(
            stored.collections(),
            vec!["structured_rows", "structured_summaries"]
        );
        assert_eq!(stored.last_error.as_deref(), Some("write failed"));

        let counts = tracker.counts_by_status().await.unwrap();
        assert_eq!(counts[&FileStatus::Partial], 1);
        assert_eq!(counts[&FileStatus::Indexed], 0);
        assert_eq!(tracker.list_by_status(FileStatus::Partial).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recent_and_remove() {
        let dir = tempdir().unwrap();
        let tracker = tracker().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            let path = dir.path().join(name);
            std::fs::write(&path, name).unwrap();
            record_indexed(&tracker, &path).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let recent = tracker.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].path.ends_with("c.txt"));
        assert!(recent[1].path.ends_with("b.txt"));

        assert!(tracker.remove(&dir.path().join("a.txt")).await.unwrap());
        assert!(!tracker.remove(&dir.path().join("a.txt")).await.unwrap());
        assert!(tracker.get(&dir.path().join("a.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistent_database_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state/tracker.db");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "Alpha beta gamma.").unwrap();

        {
            let tracker = ChangeTracker::open(&db_path, Arc::new(LocalFilesystem))
                .await
                .unwrap();
            record_indexed(&tracker, &file).await;
        }

        let tracker = ChangeTracker::open(&db_path, Arc::new(LocalFilesystem))
            .await
            .unwrap();
        let (needed, prior) = tracker.needs_indexing(&file).await.unwrap();
        assert!(!needed);
        assert!(prior.is_some());
    }

    #[tokio::test]
    async fn test_path_lock_serializes_holders() {
        let tracker = Arc::new(tracker().await);
        let path = PathBuf::from("/data/a.txt");
        let guard = tracker.lock_path(&path).await;

        let contender = {
            let tracker = Arc::clone(&tracker);
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = tracker.lock_path(&path).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
