//! The on-disk LRU index of the local object cache.
//!
//! Backed by SQLite with three logical tables: `objects` (the LRU mapping
//! itself), `pinned` (the subset exempt from eviction), and `fscache` (cache
//! directory bookkeeping used during rebuild). A `properties` table carries
//! the schema tag and a dirty flag; an unclean shutdown leaves the flag set
//! and triggers a rebuild from the cache directory on the next start.
//!
//! Sequence numbers order eviction. Volatile entries carry the top bit of
//! their sequence number, which makes them negative in the signed column and
//! therefore the first candidates of every ascending scan.

use crate::error::{QuotaError, QuotaResult};
use cairn_core::digest::{SUFFIX_CATALOG, SUFFIX_TEMPORARY};
use cairn_core::{CacheConfig, Digest, QuotaConfig};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Sign bit marking volatile entries; they sort before everything else.
const VOLATILE_FLAG: u64 = 1 << 63;

const SEQ_VALUE_MASK: i64 = i64::MAX;

/// Warn when pinned bytes reach this percentage of the pinned budget.
const HIGH_PIN_WATERMARK_PCT: u64 = 75;

/// How an object entered the cache. Stored in the `kind` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum ObjectKind {
    /// Plain data object under normal LRU.
    Regular = 0,
    /// A pinned catalog.
    Catalog = 1,
    /// Opted into aggressive eviction.
    Volatile = 2,
    /// A pinned non-catalog object.
    Pinned = 3,
}

impl ObjectKind {
    fn from_db(value: i64) -> QuotaResult<ObjectKind> {
        match value {
            0 => Ok(ObjectKind::Regular),
            1 => Ok(ObjectKind::Catalog),
            2 => Ok(ObjectKind::Volatile),
            3 => Ok(ObjectKind::Pinned),
            _ => Err(QuotaError::IndexCorrupt(format!(
                "unknown object kind {value}"
            ))),
        }
    }

    /// Suffix character of the cache file for this kind of object.
    fn suffix(self) -> Option<char> {
        match self {
            ObjectKind::Catalog => Some(SUFFIX_CATALOG),
            _ => None,
        }
    }
}

/// A batched index mutation; contiguous insert/touch commands are applied
/// in one transaction.
pub enum BatchOp {
    Insert {
        hash: Digest,
        size: u64,
        description: String,
        volatile: bool,
    },
    Touch {
        hash: Digest,
    },
}

/// Persistent LRU quota index plus its in-memory gauges.
pub struct LruIndex {
    pool: Pool<Sqlite>,
    cache_dir: PathBuf,
    limit: u64,
    cleanup_threshold: u64,
    pinned_limit: u64,
    async_delete: bool,
    gauge: u64,
    pinned_gauge: u64,
    next_seq: u64,
    pinned_chunks: HashMap<Digest, u64>,
}

impl LruIndex {
    /// Open (or create) the index under the configured workspace.
    ///
    /// A dirty flag left behind by an unclean shutdown, or an explicit
    /// `rebuild` request, reconstructs the index from the cache directory.
    /// Pins are process-scoped and never survive a reopen.
    pub async fn open(
        cache: &CacheConfig,
        quota: &QuotaConfig,
        rebuild: bool,
    ) -> QuotaResult<LruIndex> {
        std::fs::create_dir_all(cache.workspace())?;
        std::fs::create_dir_all(&cache.cache_dir)?;

        let db_path = cache.cachedb_path();
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .map_err(QuotaError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // A single connection; the command server is the only writer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let mut index = LruIndex {
            pool,
            cache_dir: cache.cache_dir.clone(),
            limit: quota.limit,
            cleanup_threshold: quota.threshold(),
            pinned_limit: quota.pinned_limit(),
            async_delete: quota.async_delete,
            gauge: 0,
            pinned_gauge: 0,
            next_seq: 1,
            pinned_chunks: HashMap::new(),
        };
        index.migrate().await?;

        let dirty = index.get_property("dirty").await?.as_deref() == Some("1");
        if rebuild || dirty {
            if dirty {
                tracing::warn!("cache index was not shut down cleanly, rebuilding");
            }
            index.rebuild().await?;
        } else {
            index.load_state().await?;
        }

        index.set_property("dirty", "1").await?;
        index.check_free_space();
        Ok(index)
    }

    async fn migrate(&self) -> QuotaResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS objects (
                 hash TEXT PRIMARY KEY,
                 size INTEGER NOT NULL,
                 seq INTEGER NOT NULL,
                 path TEXT NOT NULL DEFAULT '',
                 kind INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_objects_seq ON objects(seq)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS pinned (hash TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS fscache (hash TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS properties (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO properties (key, value) VALUES ('schema', '1.0')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load gauges and the sequence counter from the persisted rows. Pins
    /// from a previous process are dissolved back into the normal LRU.
    async fn load_state(&mut self) -> QuotaResult<()> {
        sqlx::query("DELETE FROM pinned").execute(&self.pool).await?;
        sqlx::query("UPDATE objects SET kind = ? WHERE kind = ?")
            .bind(ObjectKind::Regular as i64)
            .bind(ObjectKind::Pinned as i64)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(
            "SELECT COALESCE(SUM(size), 0), COALESCE(MAX(seq & ?), 0) FROM objects",
        )
        .bind(SEQ_VALUE_MASK)
        .fetch_one(&self.pool)
        .await?;
        self.gauge = row.get::<i64, _>(0) as u64;
        self.next_seq = row.get::<i64, _>(1) as u64 + 1;
        self.pinned_gauge = 0;
        self.pinned_chunks.clear();
        Ok(())
    }

    /// Reconstruct all rows from a scan of the cache directory. Sequence
    /// numbers are assigned in directory-iteration order; pins are
    /// process-scoped and do not survive.
    async fn rebuild(&mut self) -> QuotaResult<()> {
        tracing::info!(cache_dir = %self.cache_dir.display(), "rebuilding cache index");
        sqlx::query("DELETE FROM objects").execute(&self.pool).await?;
        sqlx::query("DELETE FROM pinned").execute(&self.pool).await?;
        sqlx::query("DELETE FROM fscache").execute(&self.pool).await?;

        let mut seq = 1u64;
        let mut gauge = 0u64;

        for dir_entry in std::fs::read_dir(&self.cache_dir)? {
            let dir_entry = dir_entry?;
            let dir_name = dir_entry.file_name();
            let Some(prefix) = dir_name.to_str() else {
                continue;
            };
            let is_hex_level = prefix.len() == 2
                && prefix
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            if !is_hex_level || !dir_entry.file_type()?.is_dir() {
                continue;
            }

            for file_entry in std::fs::read_dir(dir_entry.path())? {
                let file_entry = file_entry?;
                let file_name = file_entry.file_name();
                let Some(rest) = file_name.to_str() else {
                    continue;
                };
                let Ok(digest) = Digest::parse_hex(&format!("{prefix}{rest}")) else {
                    tracing::debug!(file = %file_entry.path().display(), "skipping foreign cache file");
                    continue;
                };
                if digest.suffix() == Some(SUFFIX_TEMPORARY) {
                    continue;
                }
                let size = file_entry.metadata()?.len();
                let kind = if digest.suffix() == Some(SUFFIX_CATALOG) {
                    ObjectKind::Catalog
                } else {
                    ObjectKind::Regular
                };

                let hex = digest.to_hex();
                sqlx::query("INSERT OR IGNORE INTO fscache (hash) VALUES (?)")
                    .bind(&hex)
                    .execute(&self.pool)
                    .await?;
                sqlx::query(
                    "INSERT OR REPLACE INTO objects (hash, size, seq, path, kind)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&hex)
                .bind(size as i64)
                .bind(seq as i64)
                .bind(digest.cache_path_explicit(1, 2, digest.suffix()))
                .bind(kind as i64)
                .execute(&self.pool)
                .await?;

                seq += 1;
                gauge += size;
            }
        }

        self.next_seq = seq;
        self.gauge = gauge;
        self.pinned_gauge = 0;
        self.pinned_chunks.clear();
        tracing::info!(objects = seq - 1, bytes = gauge, "cache index rebuilt");
        Ok(())
    }

    /// Mark the index clean. Call on orderly shutdown.
    pub async fn checkpoint(&self) -> QuotaResult<()> {
        self.set_property("dirty", "0").await
    }

    /// Checkpoint and release the database.
    pub async fn close(self) -> QuotaResult<()> {
        self.checkpoint().await?;
        self.pool.close().await;
        Ok(())
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn cleanup_threshold(&self) -> u64 {
        self.cleanup_threshold
    }

    /// Bytes currently under normal LRU accounting (excludes pinned).
    pub fn gauge(&self) -> u64 {
        self.gauge
    }

    /// Bytes currently pinned.
    pub fn pinned_gauge(&self) -> u64 {
        self.pinned_gauge
    }

    /// Largest object the cache can admit next to the current pins.
    pub fn max_file_size(&self) -> u64 {
        self.limit.saturating_sub(self.pinned_gauge)
    }

    /// Bump an object to the most recently used position.
    pub async fn touch(&mut self, hash: &Digest) -> QuotaResult<()> {
        let seq = self.alloc_seq(false);
        let volatile_seq = ((seq as u64) | VOLATILE_FLAG) as i64;
        sqlx::query("UPDATE objects SET seq = CASE WHEN kind = ? THEN ? ELSE ? END WHERE hash = ?")
            .bind(ObjectKind::Volatile as i64)
            .bind(volatile_seq)
            .bind(seq)
            .bind(hash.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or refresh an object row. Pinned objects are left untouched.
    /// The caller decides whether the new gauge warrants a cleanup.
    pub async fn insert(
        &mut self,
        hash: &Digest,
        size: u64,
        description: &str,
        volatile: bool,
    ) -> QuotaResult<()> {
        if self.pinned_chunks.contains_key(hash) {
            return Ok(());
        }

        let previous = self.size_of(hash).await?;
        let kind = if volatile {
            ObjectKind::Volatile
        } else {
            ObjectKind::Regular
        };
        let seq = self.alloc_seq(volatile);
        sqlx::query(
            "INSERT INTO objects (hash, size, seq, path, kind) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(hash) DO UPDATE SET
                 size = excluded.size, seq = excluded.seq,
                 path = excluded.path, kind = excluded.kind",
        )
        .bind(hash.to_hex())
        .bind(size as i64)
        .bind(seq)
        .bind(description)
        .bind(kind as i64)
        .execute(&self.pool)
        .await?;

        self.gauge = self.gauge - previous.unwrap_or(0) + size;
        self.check_high_pin_watermark();
        Ok(())
    }

    /// Pin an object, exempting it from eviction.
    ///
    /// Admission is checked against the pinned budget before the new object
    /// is accounted: once the budget is exceeded, further pins fail with
    /// [`QuotaError::PinLimit`] and leave all gauges unchanged.
    pub async fn pin(
        &mut self,
        hash: &Digest,
        size: u64,
        description: &str,
        is_catalog: bool,
    ) -> QuotaResult<()> {
        if self.pinned_chunks.contains_key(hash) {
            self.touch(hash).await?;
            return Ok(());
        }
        if size > self.limit || self.pinned_gauge > self.pinned_limit {
            return Err(QuotaError::PinLimit);
        }

        let previous = self.size_of(hash).await?;
        let kind = if is_catalog {
            ObjectKind::Catalog
        } else {
            ObjectKind::Pinned
        };
        let seq = self.alloc_seq(false);
        sqlx::query(
            "INSERT INTO objects (hash, size, seq, path, kind) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(hash) DO UPDATE SET
                 size = excluded.size, seq = excluded.seq,
                 path = excluded.path, kind = excluded.kind",
        )
        .bind(hash.to_hex())
        .bind(size as i64)
        .bind(seq)
        .bind(description)
        .bind(kind as i64)
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO pinned (hash) VALUES (?)")
            .bind(hash.to_hex())
            .execute(&self.pool)
            .await?;

        // Mass moves from the LRU gauge to the pinned gauge.
        self.gauge = self.gauge.saturating_sub(previous.unwrap_or(0));
        self.pinned_gauge += size;
        self.pinned_chunks.insert(*hash, size);
        self.check_high_pin_watermark();
        Ok(())
    }

    /// Return a pinned object to normal LRU accounting.
    pub async fn unpin(&mut self, hash: &Digest) -> QuotaResult<()> {
        let Some(size) = self.pinned_chunks.remove(hash) else {
            return Ok(());
        };
        sqlx::query("DELETE FROM pinned WHERE hash = ?")
            .bind(hash.to_hex())
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE objects SET kind = ? WHERE hash = ? AND kind = ?")
            .bind(ObjectKind::Regular as i64)
            .bind(hash.to_hex())
            .bind(ObjectKind::Pinned as i64)
            .execute(&self.pool)
            .await?;
        self.touch(hash).await?;

        self.pinned_gauge = self.pinned_gauge.saturating_sub(size);
        self.gauge += size;
        Ok(())
    }

    /// Drop an object from the index and delete its cache file.
    pub async fn remove(&mut self, hash: &Digest) -> QuotaResult<()> {
        let row = sqlx::query("SELECT size, kind FROM objects WHERE hash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let size = row.get::<i64, _>(0) as u64;
        let kind = ObjectKind::from_db(row.get::<i64, _>(1))?;

        if self.pinned_chunks.remove(hash).is_some() {
            sqlx::query("DELETE FROM pinned WHERE hash = ?")
                .bind(hash.to_hex())
                .execute(&self.pool)
                .await?;
            self.pinned_gauge = self.pinned_gauge.saturating_sub(size);
        } else {
            self.gauge = self.gauge.saturating_sub(size);
        }
        sqlx::query("DELETE FROM objects WHERE hash = ?")
            .bind(hash.to_hex())
            .execute(&self.pool)
            .await?;

        let path = self.object_path(hash, kind);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "failed to remove cache file");
            }
        }
        Ok(())
    }

    /// Size of an object, if present.
    pub async fn size_of(&self, hash: &Digest) -> QuotaResult<Option<u64>> {
        let row = sqlx::query("SELECT size FROM objects WHERE hash = ?")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0) as u64))
    }

    /// True if the object is tracked.
    pub async fn contains(&self, hash: &Digest) -> QuotaResult<bool> {
        Ok(self.size_of(hash).await?.is_some())
    }

    /// Evict least-recently-used entries until at most `leave_size` bytes of
    /// unpinned mass remain.
    ///
    /// Volatile entries go first courtesy of their sign-bit sequence
    /// numbers. Pinned entries are never candidates. The run stops at the
    /// first file that cannot be deleted. Returns whether the target was
    /// reached.
    pub async fn cleanup(&mut self, leave_size: u64) -> QuotaResult<bool> {
        let mut deferred_unlinks: Vec<PathBuf> = Vec::new();

        while self.gauge > leave_size {
            let row = sqlx::query(
                "SELECT hash, size, kind FROM objects
                 WHERE hash NOT IN (SELECT hash FROM pinned)
                 ORDER BY seq ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                break;
            };

            let hex: String = row.get(0);
            let size = row.get::<i64, _>(1) as u64;
            let kind = ObjectKind::from_db(row.get::<i64, _>(2))?;
            let digest = Digest::parse_hex(&hex)
                .map_err(|e| QuotaError::IndexCorrupt(format!("bad hash column {hex:?}: {e}")))?;

            let path = self.object_path(&digest, kind);
            if self.async_delete {
                deferred_unlinks.push(path);
            } else {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        self.spawn_deferred_unlinks(deferred_unlinks);
                        return Err(QuotaError::UnlinkFailed { path, source: e });
                    }
                }
            }

            sqlx::query("DELETE FROM objects WHERE hash = ?")
                .bind(&hex)
                .execute(&self.pool)
                .await?;
            self.gauge = self.gauge.saturating_sub(size);
        }

        self.spawn_deferred_unlinks(deferred_unlinks);
        Ok(self.gauge <= leave_size)
    }

    /// Hand a batch of unlinks to a detached process; the index rows are
    /// already gone, so the gauge is correct regardless of when the files
    /// actually disappear.
    fn spawn_deferred_unlinks(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let spawned = tokio::process::Command::new("rm")
            .arg("-f")
            .args(&paths)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            tracing::warn!(error = %e, files = paths.len(), "failed to start async delete");
        }
    }

    /// Apply a coalesced run of insert/touch operations in one transaction.
    pub async fn apply_batch(&mut self, ops: Vec<BatchOp>) -> QuotaResult<()> {
        let pool = self.pool.clone();
        let mut tx = pool.begin().await?;
        let mut gauge = self.gauge;

        for op in &ops {
            match op {
                BatchOp::Insert {
                    hash,
                    size,
                    description,
                    volatile,
                } => {
                    if self.pinned_chunks.contains_key(hash) {
                        continue;
                    }
                    let previous = sqlx::query("SELECT size FROM objects WHERE hash = ?")
                        .bind(hash.to_hex())
                        .fetch_optional(&mut *tx)
                        .await?
                        .map(|r| r.get::<i64, _>(0) as u64);
                    let kind = if *volatile {
                        ObjectKind::Volatile
                    } else {
                        ObjectKind::Regular
                    };
                    let seq = self.alloc_seq(*volatile);
                    sqlx::query(
                        "INSERT INTO objects (hash, size, seq, path, kind) VALUES (?, ?, ?, ?, ?)
                         ON CONFLICT(hash) DO UPDATE SET
                             size = excluded.size, seq = excluded.seq,
                             path = excluded.path, kind = excluded.kind",
                    )
                    .bind(hash.to_hex())
                    .bind(*size as i64)
                    .bind(seq)
                    .bind(description.as_str())
                    .bind(kind as i64)
                    .execute(&mut *tx)
                    .await?;
                    gauge = gauge - previous.unwrap_or(0) + size;
                }
                BatchOp::Touch { hash } => {
                    let seq = self.alloc_seq(false);
                    let volatile_seq = ((seq as u64) | VOLATILE_FLAG) as i64;
                    sqlx::query(
                        "UPDATE objects SET seq = CASE WHEN kind = ? THEN ? ELSE ? END
                         WHERE hash = ?",
                    )
                    .bind(ObjectKind::Volatile as i64)
                    .bind(volatile_seq)
                    .bind(seq)
                    .bind(hash.to_hex())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        self.gauge = gauge;
        Ok(())
    }

    /// All tracked objects' descriptions in LRU order.
    pub async fn list(&self) -> QuotaResult<Vec<String>> {
        self.list_query("SELECT path FROM objects ORDER BY seq ASC")
            .await
    }

    /// Descriptions of pinned objects.
    pub async fn list_pinned(&self) -> QuotaResult<Vec<String>> {
        self.list_query(
            "SELECT path FROM objects WHERE hash IN (SELECT hash FROM pinned) ORDER BY seq ASC",
        )
        .await
    }

    /// Descriptions of tracked catalogs.
    pub async fn list_catalogs(&self) -> QuotaResult<Vec<String>> {
        let rows = sqlx::query("SELECT path FROM objects WHERE kind = ? ORDER BY seq ASC")
            .bind(ObjectKind::Catalog as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    /// Descriptions of volatile objects.
    pub async fn list_volatile(&self) -> QuotaResult<Vec<String>> {
        let rows = sqlx::query("SELECT path FROM objects WHERE kind = ? ORDER BY seq ASC")
            .bind(ObjectKind::Volatile as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn list_query(&self, sql: &str) -> QuotaResult<Vec<String>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    /// Absolute path of an object's cache file.
    pub fn object_path(&self, hash: &Digest, kind: ObjectKind) -> PathBuf {
        self.cache_dir
            .join(hash.cache_path_explicit(1, 2, kind.suffix()))
    }

    fn alloc_seq(&mut self, volatile: bool) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if volatile {
            (seq | VOLATILE_FLAG) as i64
        } else {
            seq as i64
        }
    }

    fn check_high_pin_watermark(&self) {
        if self.pinned_limit > 0 && 100 * self.pinned_gauge >= HIGH_PIN_WATERMARK_PCT * self.pinned_limit
        {
            tracing::warn!(
                pinned = self.pinned_gauge,
                pinned_limit = self.pinned_limit,
                "high watermark of pinned files"
            );
        }
    }

    /// Warn when the cache volume cannot even hold the configured limit.
    fn check_free_space(&self) {
        use std::os::unix::ffi::OsStrExt;

        let Ok(path) = std::ffi::CString::new(self.cache_dir.as_os_str().as_bytes()) else {
            return;
        };
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
            return;
        }
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        if available < self.limit {
            tracing::warn!(
                available,
                limit = self.limit,
                "cache volume has less free space than the configured limit"
            );
        }
    }

    async fn get_property(&self, key: &str) -> QuotaResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM properties WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn set_property(&self, key: &str, value: &str) -> QuotaResult<()> {
        sqlx::query("INSERT OR REPLACE INTO properties (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::Algorithm;
    use cairn_core::digest::hash_mem;
    use tempfile::TempDir;

    fn digest(name: &str) -> Digest {
        hash_mem(name.as_bytes(), Algorithm::Sha1)
    }

    async fn open_index(dir: &TempDir, limit: u64) -> LruIndex {
        let cache = CacheConfig::new(dir.path());
        let quota = QuotaConfig::new(limit);
        LruIndex::open(&cache, &quota, false).await.unwrap()
    }

    /// Create the cache file behind a digest so eviction has something to
    /// unlink.
    fn materialize(index: &LruIndex, hash: &Digest, kind: ObjectKind, size: usize) {
        let path = index.object_path(hash, kind);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; size]).unwrap();
    }

    #[tokio::test]
    async fn test_insert_updates_gauge_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 1000).await;

        index.insert(&digest("a"), 10, "/a", false).await.unwrap();
        index.insert(&digest("b"), 20, "/b", false).await.unwrap();
        assert_eq!(index.gauge(), 30);

        // Re-inserting the same object replaces its row instead of leaking
        // gauge.
        index.insert(&digest("a"), 15, "/a", false).await.unwrap();
        assert_eq!(index.gauge(), 35);
        assert_eq!(index.size_of(&digest("a")).await.unwrap(), Some(15));
    }

    #[tokio::test]
    async fn test_eviction_follows_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        for name in ["old", "middle", "new"] {
            let hash = digest(name);
            index.insert(&hash, 10, name, false).await.unwrap();
            materialize(&index, &hash, ObjectKind::Regular, 10);
        }

        assert!(index.cleanup(20).await.unwrap());
        assert_eq!(index.gauge(), 20);
        assert!(!index.contains(&digest("old")).await.unwrap());
        assert!(index.contains(&digest("middle")).await.unwrap());
        assert!(index.contains(&digest("new")).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_rescues_from_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        for name in ["first", "second"] {
            let hash = digest(name);
            index.insert(&hash, 10, name, false).await.unwrap();
            materialize(&index, &hash, ObjectKind::Regular, 10);
        }
        index.touch(&digest("first")).await.unwrap();

        assert!(index.cleanup(10).await.unwrap());
        assert!(index.contains(&digest("first")).await.unwrap());
        assert!(!index.contains(&digest("second")).await.unwrap());
    }

    #[tokio::test]
    async fn test_volatile_entries_evicted_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        let stable = digest("stable");
        index.insert(&stable, 10, "/stable", false).await.unwrap();
        materialize(&index, &stable, ObjectKind::Regular, 10);

        // Volatile but most recently inserted; still evicted first.
        let volatile = digest("volatile");
        index.insert(&volatile, 10, "/volatile", true).await.unwrap();
        materialize(&index, &volatile, ObjectKind::Volatile, 10);

        assert!(index.cleanup(10).await.unwrap());
        assert!(index.contains(&stable).await.unwrap());
        assert!(!index.contains(&volatile).await.unwrap());
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        let pinned = digest("catalog");
        index.pin(&pinned, 10, "/catalog", true).await.unwrap();
        materialize(&index, &pinned, ObjectKind::Catalog, 10);

        let loose = digest("loose");
        index.insert(&loose, 10, "/loose", false).await.unwrap();
        materialize(&index, &loose, ObjectKind::Regular, 10);

        assert!(index.cleanup(0).await.unwrap());
        assert!(index.contains(&pinned).await.unwrap());
        assert!(!index.contains(&loose).await.unwrap());
        assert_eq!(index.pinned_gauge(), 10);
    }

    #[tokio::test]
    async fn test_pin_admission_against_budget() {
        let dir = tempfile::tempdir().unwrap();
        // limit 10, pinned budget 50% = 5
        let mut index = open_index(&dir, 10).await;

        index.pin(&digest("p1"), 4, "/p1", true).await.unwrap();
        // Budget not yet exceeded: this pin is admitted and overshoots.
        index.pin(&digest("p2"), 2, "/p2", true).await.unwrap();
        assert_eq!(index.pinned_gauge(), 6);

        // Budget exhausted now: further pins fail, gauges unchanged.
        let denied = index.pin(&digest("p3"), 3, "/p3", true).await;
        assert!(matches!(denied, Err(QuotaError::PinLimit)));
        assert_eq!(index.pinned_gauge(), 6);
        assert_eq!(index.gauge(), 0);
    }

    #[tokio::test]
    async fn test_unpin_returns_to_lru() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        let hash = digest("pinned-data");
        index.pin(&hash, 10, "/pd", false).await.unwrap();
        assert_eq!(index.pinned_gauge(), 10);
        assert_eq!(index.gauge(), 0);

        index.unpin(&hash).await.unwrap();
        assert_eq!(index.pinned_gauge(), 0);
        assert_eq!(index.gauge(), 10);

        materialize(&index, &hash, ObjectKind::Regular, 10);
        assert!(index.cleanup(0).await.unwrap());
        assert!(!index.contains(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_lists_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 100).await;

        index.insert(&digest("r"), 1, "/regular", false).await.unwrap();
        index.insert(&digest("v"), 1, "/volatile", true).await.unwrap();
        index.pin(&digest("c"), 1, "/catalog", true).await.unwrap();

        assert_eq!(index.list().await.unwrap().len(), 3);
        assert_eq!(index.list_pinned().await.unwrap(), vec!["/catalog"]);
        assert_eq!(index.list_catalogs().await.unwrap(), vec!["/catalog"]);
        assert_eq!(index.list_volatile().await.unwrap(), vec!["/volatile"]);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = open_index(&dir, 100).await;
            index.insert(&digest("kept"), 25, "/kept", false).await.unwrap();
            index.pin(&digest("pin"), 5, "/pin", true).await.unwrap();
            index.close().await.unwrap();
        }

        let index = open_index(&dir, 100).await;
        // Pins are process-scoped: the pinned mass folds back into the
        // gauge on reopen.
        assert_eq!(index.gauge(), 30);
        assert_eq!(index.pinned_gauge(), 0);
        assert!(index.contains(&digest("kept")).await.unwrap());
    }

    #[tokio::test]
    async fn test_dirty_index_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let (catalog, data) = (digest("cat"), digest("dat"));
        {
            let mut index = open_index(&dir, 100).await;
            index.insert(&data, 3, "/dat", false).await.unwrap();
            materialize(&index, &data, ObjectKind::Regular, 3);
            materialize(&index, &catalog.with_suffix(SUFFIX_CATALOG), ObjectKind::Catalog, 7);
            // No close(): the dirty flag stays set.
        }

        let index = open_index(&dir, 100).await;
        assert!(index.contains(&data).await.unwrap());
        assert!(index.contains(&catalog).await.unwrap());
        assert_eq!(index.gauge(), 10);
        // The rebuilt catalog row is typed by its cache file suffix.
        assert_eq!(index.list_catalogs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_matches_sequential_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir, 1000).await;

        let ops = vec![
            BatchOp::Insert {
                hash: digest("b1"),
                size: 5,
                description: "/b1".to_string(),
                volatile: false,
            },
            BatchOp::Insert {
                hash: digest("b2"),
                size: 7,
                description: "/b2".to_string(),
                volatile: true,
            },
            BatchOp::Touch { hash: digest("b1") },
        ];
        index.apply_batch(ops).await.unwrap();

        assert_eq!(index.gauge(), 12);
        assert_eq!(index.size_of(&digest("b2")).await.unwrap(), Some(7));
        assert_eq!(index.list_volatile().await.unwrap(), vec!["/b2"]);
    }
}
