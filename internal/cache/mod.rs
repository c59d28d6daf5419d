use crate::fs::EntryInfo;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("entry not found")]
    NotFound,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("multiple entries deleted for path: {0}")]
    MultipleDeleted(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Aggregate counters for a prefix, as reported by `get_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub processed: i64,
    pub pending: i64,
    pub total_size: i64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    is_dir INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    processed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_path_dirname
    ON entries (rtrim(path, replace(path, '/', '')));
";

const SELECT_COLUMNS: &str = "SELECT path, size, last_modified, is_dir, processed FROM entries";

/// Persistent path index over the backend tree. A single exclusive lock
/// guards writes; reads share the lock.
#[derive(Clone)]
pub struct Cache {
    pool: SqlitePool,
    lock: Arc<RwLock<()>>,
}

impl Cache {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        Self::open(options, 5).await
    }

    /// In-memory store. Capped at one connection so every handle sees the
    /// same database.
    pub async fn connect_in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        Self::open(options, 1).await
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Statistics refresh hint. Never changes observable state.
    pub async fn optimise(&self) -> Result<(), CacheError> {
        let _guard = self.lock.write().await;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        Ok(())
    }

    /// Transactional upsert. On path conflict `last_modified` merges to the
    /// maximum and `processed` to logical OR; everything else is overwritten.
    pub async fn insert(&self, entries: &[EntryInfo]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            validate_entry(entry)?;
        }
        let _guard = self.lock.write().await;
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO entries (path, size, last_modified, is_dir, updated_at, processed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                     size = excluded.size,
                     is_dir = excluded.is_dir, updated_at = excluded.updated_at,
                     last_modified = MAX(excluded.last_modified, last_modified),
                     processed = MAX(excluded.processed, processed)",
            )
            .bind(&entry.path)
            .bind(entry.size)
            .bind(entry.last_modified)
            .bind(entry.is_dir)
            .bind(now)
            .bind(entry.processed)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<EntryInfo, CacheError> {
        if path.starts_with('/') {
            return Err(CacheError::InvalidPath(path.to_string()));
        }
        let _guard = self.lock.read().await;
        let row = sqlx::query(&format!("{} WHERE path = ?1", SELECT_COLUMNS))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| entry_from_row(&row))
            .ok_or(CacheError::NotFound)
    }

    /// Ordered prefix scan. `prefix` must be empty or end with `/`; results
    /// are strict descendants of the prefix, ascending by path, at most
    /// `limit` rows plus a truncation flag.
    pub async fn list(
        &self,
        prefix: &str,
        marker: &str,
        dirs_only: bool,
        limit: i64,
    ) -> Result<(Vec<EntryInfo>, bool), CacheError> {
        validate_optional_prefix(prefix)?;
        if marker.starts_with('/') {
            return Err(CacheError::InvalidPath(marker.to_string()));
        }

        let mut query = format!("{} WHERE 1=1", SELECT_COLUMNS);
        let mut binds: Vec<String> = Vec::new();
        if !marker.is_empty() {
            query.push_str(" AND path > ?");
            binds.push(marker.to_string());
        }
        if !prefix.is_empty() {
            query.push_str(" AND path > ? AND path < ?");
            binds.push(prefix.to_string());
            binds.push(prefix_upper_bound(prefix));
        }
        if dirs_only {
            // Immediate children only: nothing after the prefix may contain
            // a slash once a trailing one is stripped.
            query.push_str(" AND instr(substr(rtrim(path, '/'), length(?) + 1), '/') = 0");
            binds.push(prefix.to_string());
        } else {
            query.push_str(" AND is_dir = 0");
        }
        query.push_str(" ORDER BY path LIMIT ?");

        let _guard = self.lock.read().await;
        let mut prepared = sqlx::query(&query);
        for bind in &binds {
            prepared = prepared.bind(bind);
        }
        prepared = prepared.bind(limit + 1);
        let rows = prepared.fetch_all(&self.pool).await?;
        let mut entries: Vec<EntryInfo> = rows.iter().map(entry_from_row).collect();
        let truncated = entries.len() as i64 > limit;
        if truncated {
            entries.truncate(limit as usize);
        }
        Ok((entries, truncated))
    }

    /// Removes a subtree when `path` ends with `/`, a single file row
    /// otherwise. A file delete that matches more than one row fails and
    /// rolls back.
    pub async fn delete(&self, path: &str) -> Result<(), CacheError> {
        if path.starts_with('/') {
            return Err(CacheError::InvalidPath(path.to_string()));
        }
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        if path.ends_with('/') {
            sqlx::query("DELETE FROM entries WHERE path >= ?1 AND path < ?2")
                .bind(path)
                .bind(prefix_upper_bound(path))
                .execute(&mut *tx)
                .await?;
        } else {
            let affected = sqlx::query("DELETE FROM entries WHERE path = ?1")
                .bind(path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if affected > 1 {
                return Err(CacheError::MultipleDeleted(path.to_string()));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_stats(&self, prefix: &str) -> Result<CacheStats, CacheError> {
        validate_prefix(prefix)?;
        let _guard = self.lock.read().await;
        let row = sqlx::query(
            "SELECT
                 COALESCE(SUM(processed = 1), 0),
                 COALESCE(SUM(processed = 0), 0),
                 COALESCE(SUM(size), 0)
             FROM entries WHERE path >= ?1 AND path < ?2",
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            processed: row.get(0),
            pending: row.get(1),
            total_size: row.get(2),
        })
    }

    /// Directories under `prefix` still waiting for a walk, ascending.
    pub async fn list_pending_dirs(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<EntryInfo>, CacheError> {
        validate_prefix(prefix)?;
        let _guard = self.lock.read().await;
        let rows = sqlx::query(&format!(
            "{} WHERE path >= ?1 AND path < ?2 AND processed = 0 AND is_dir = 1
             ORDER BY path LIMIT ?3",
            SELECT_COLUMNS
        ))
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Processed directories under `prefix` with no other row having them as
    /// an ancestor. Descending by path so leaves come before their parents.
    pub async fn list_dangling_dirs(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<EntryInfo>, CacheError> {
        validate_prefix(prefix)?;
        let _guard = self.lock.read().await;
        let rows = sqlx::query(
            "SELECT d.path, d.size, d.last_modified, d.is_dir, d.processed FROM entries d
             WHERE d.path >= ?1 AND d.path < ?2 AND d.processed = 1 AND d.is_dir = 1
               AND NOT EXISTS (
                   SELECT 1 FROM entries c
                   WHERE substr(c.path, 1, length(d.path)) = d.path AND c.path <> d.path
               )
             ORDER BY d.path DESC LIMIT ?3",
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Evicts files under `prefix` that were not re-observed by the last
    /// scan (`processed = false`). Returns the number of rows removed.
    pub async fn delete_dangling_files(&self, prefix: &str) -> Result<i64, CacheError> {
        validate_prefix(prefix)?;
        let _guard = self.lock.write().await;
        let result = sqlx::query(
            "DELETE FROM entries
             WHERE path >= ?1 AND path < ?2 AND is_dir = 0 AND processed = 0",
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as i64)
    }

    /// Flips `processed` for one row, or for the whole subtree when
    /// `recursive` and `path` ends with `/`. Only rows whose flag differs
    /// count toward the returned total.
    pub async fn set_processed(
        &self,
        path: &str,
        recursive: bool,
        processed: bool,
    ) -> Result<i64, CacheError> {
        if path.starts_with('/') {
            return Err(CacheError::InvalidPath(path.to_string()));
        }
        let _guard = self.lock.write().await;
        let result = if recursive && path.ends_with('/') {
            sqlx::query(
                "UPDATE entries SET processed = ?1
                 WHERE processed <> ?1 AND path >= ?2 AND path < ?3",
            )
            .bind(processed)
            .bind(path)
            .bind(prefix_upper_bound(path))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE entries SET processed = ?1 WHERE processed <> ?1 AND path = ?2")
                .bind(processed)
                .bind(path)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() as i64)
    }
}

fn entry_from_row(row: &SqliteRow) -> EntryInfo {
    EntryInfo {
        path: row.get(0),
        size: row.get(1),
        last_modified: row.get(2),
        is_dir: row.get::<i64, _>(3) != 0,
        processed: row.get::<i64, _>(4) != 0,
    }
}

fn validate_entry(entry: &EntryInfo) -> Result<(), CacheError> {
    if entry.path.is_empty() || entry.path.starts_with('/') {
        return Err(CacheError::InvalidPath(entry.path.clone()));
    }
    if entry.is_dir != entry.path.ends_with('/') {
        return Err(CacheError::InvalidPath(entry.path.clone()));
    }
    Ok(())
}

fn validate_prefix(prefix: &str) -> Result<(), CacheError> {
    if prefix.starts_with('/') || !prefix.ends_with('/') {
        return Err(CacheError::InvalidPath(prefix.to_string()));
    }
    Ok(())
}

fn validate_optional_prefix(prefix: &str) -> Result<(), CacheError> {
    if prefix.is_empty() {
        return Ok(());
    }
    validate_prefix(prefix)
}

/// Exact upper bound for a prefix scan: the prefix with its final `/`
/// replaced by the next byte. Every descendant path sorts strictly below it.
fn prefix_upper_bound(prefix: &str) -> String {
    debug_assert!(prefix.ends_with('/'));
    let mut upper = prefix[..prefix.len() - 1].to_string();
    upper.push('0');
    upper
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR_STRUCTURE: &[&str] = &[
        "bucket-a/",
        "bucket-a/folder-a/",
        "bucket-a/folder-a/efgh/",
        "bucket-a/folder-b/",
        "bucket-a/folder-b/ijkl/",
        "bucket-a/folder-c/",
        "bucket-a/folder-c/mnop/",
        "bucket-b/",
        "bucket-b/folder-a/",
        "bucket-b/folder-a/efgh/",
    ];

    const FILE_STRUCTURE: &[&str] = &[
        "bucket-a/root-file.txt",
        "bucket-a/folder-a/efgh/efgh1234",
        "bucket-a/folder-b/ijkl/ijkl1234",
        "bucket-b/folder-a/efgh/efgh5678",
    ];

    fn entry(path: &str, processed: bool) -> EntryInfo {
        let is_dir = path.ends_with('/');
        EntryInfo {
            path: path.to_string(),
            size: if is_dir { 0 } else { 1024 },
            last_modified: 1_700_000_000,
            is_dir,
            processed,
        }
    }

    fn entries(paths: &[&str]) -> Vec<EntryInfo> {
        paths.iter().map(|path| entry(path, true)).collect()
    }

    async fn seeded_cache() -> Cache {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache.insert(&entries(DIR_STRUCTURE)).await.expect("dirs");
        cache.insert(&entries(FILE_STRUCTURE)).await.expect("files");
        cache
    }

    #[tokio::test]
    async fn insert_and_stat_round_trip() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        let original = entry("bucket/folder/file", false);
        assert!(matches!(
            cache.stat(&original.path).await.unwrap_err(),
            CacheError::NotFound
        ));

        cache
            .insert(std::slice::from_ref(&original))
            .await
            .expect("insert");
        let retrieved = cache.stat(&original.path).await.expect("stat");
        assert_eq!(retrieved, original);
    }

    #[tokio::test]
    async fn insert_rejects_invalid_paths() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        let leading_slash = EntryInfo {
            path: "/bucket/file".to_string(),
            size: 0,
            last_modified: 0,
            is_dir: false,
            processed: false,
        };
        assert!(matches!(
            cache.insert(&[leading_slash]).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));

        let slashless_dir = EntryInfo {
            path: "bucket/dir".to_string(),
            size: 0,
            last_modified: 0,
            is_dir: true,
            processed: false,
        };
        assert!(matches!(
            cache.insert(&[slashless_dir]).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));

        let slashed_file = EntryInfo {
            path: "bucket/file/".to_string(),
            size: 0,
            last_modified: 0,
            is_dir: false,
            processed: false,
        };
        assert!(matches!(
            cache.insert(&[slashed_file]).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));
    }

    #[tokio::test]
    async fn insert_merges_on_conflict() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        let mut first = entry("bucket/file", true);
        first.last_modified = 200;
        cache
            .insert(std::slice::from_ref(&first))
            .await
            .expect("insert");

        // Older observation: last_modified keeps the max, processed the OR.
        let mut second = entry("bucket/file", false);
        second.last_modified = 100;
        second.size = 2048;
        cache.insert(&[second]).await.expect("insert");

        let merged = cache.stat("bucket/file").await.expect("stat");
        assert_eq!(merged.last_modified, 200);
        assert_eq!(merged.size, 2048);
        assert!(merged.processed);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        let item = entry("bucket/file", true);
        cache
            .insert(std::slice::from_ref(&item))
            .await
            .expect("insert");
        cache
            .insert(std::slice::from_ref(&item))
            .await
            .expect("insert");
        let (results, truncated) = cache.list("bucket/", "", false, 100).await.expect("list");
        assert!(!truncated);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], item);
    }

    #[tokio::test]
    async fn list_files_with_prefix_and_marker() {
        let cache = seeded_cache().await;

        let (all, truncated) = cache.list("", "", false, 100).await.expect("list");
        assert!(!truncated);
        assert_eq!(all.len(), FILE_STRUCTURE.len());

        let (bucket_a, _) = cache.list("bucket-a/", "", false, 100).await.expect("list");
        assert_eq!(bucket_a.len(), 3);

        let (after_marker, _) = cache
            .list("bucket-a/", "bucket-a/folder-a/efgh/efgh1234", false, 100)
            .await
            .expect("list");
        assert_eq!(after_marker.len(), 2);
        assert_eq!(after_marker[0].path, "bucket-a/folder-b/ijkl/ijkl1234");
        assert_eq!(after_marker[1].path, "bucket-a/root-file.txt");
    }

    #[tokio::test]
    async fn list_dirs_only_returns_immediate_children() {
        let cache = seeded_cache().await;
        let (children, _) = cache.list("bucket-a/", "", true, 100).await.expect("list");
        let paths: Vec<&str> = children.iter().map(|entry| entry.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "bucket-a/folder-a/",
                "bucket-a/folder-b/",
                "bucket-a/folder-c/",
                "bucket-a/root-file.txt",
            ]
        );
    }

    #[tokio::test]
    async fn list_paginates_with_marker() {
        let cache = seeded_cache().await;
        let mut marker = String::new();
        let mut collected = Vec::new();
        loop {
            let (page, truncated) = cache.list("", &marker, false, 2).await.expect("list");
            assert!(page.len() <= 2);
            collected.extend(page.iter().map(|entry| entry.path.clone()));
            if !truncated {
                break;
            }
            marker = page.last().expect("page").path.clone();
        }
        let mut expected: Vec<String> =
            FILE_STRUCTURE.iter().map(|path| path.to_string()).collect();
        expected.sort();
        assert_eq!(collected, expected);
    }

    #[tokio::test]
    async fn list_truncation_fetches_one_extra() {
        let cache = seeded_cache().await;
        let (page, truncated) = cache.list("", "", false, 3).await.expect("list");
        assert!(truncated);
        assert_eq!(page.len(), 3);
    }

    #[tokio::test]
    async fn list_rejects_bad_prefix_and_marker() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        assert!(matches!(
            cache.list("/abs/", "", false, 10).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));
        assert!(matches!(
            cache.list("no-slash", "", false, 10).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));
        assert!(matches!(
            cache.list("", "/abs", false, 10).await.unwrap_err(),
            CacheError::InvalidPath(_)
        ));
    }

    #[tokio::test]
    async fn delete_file_and_subtree() {
        let cache = seeded_cache().await;

        cache
            .delete("bucket-a/root-file.txt")
            .await
            .expect("delete file");
        assert!(cache.stat("bucket-a/root-file.txt").await.is_err());

        // Deleting a missing file is not an error.
        cache.delete("nonexistent").await.expect("delete missing");

        cache
            .delete("bucket-a/folder-a/")
            .await
            .expect("delete subtree");
        assert!(cache.stat("bucket-a/folder-a/").await.is_err());
        assert!(cache.stat("bucket-a/folder-a/efgh/").await.is_err());
        assert!(cache
            .stat("bucket-a/folder-a/efgh/efgh1234")
            .await
            .is_err());
        // Siblings survive.
        cache.stat("bucket-a/folder-b/").await.expect("sibling");
    }

    #[tokio::test]
    async fn get_stats_aggregates_prefix() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                entry("bucket/", true),
                entry("bucket/done.txt", true),
                entry("bucket/todo.txt", false),
            ])
            .await
            .expect("insert");

        let stats = cache.get_stats("bucket/").await.expect("stats");
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_size, 2048);

        let empty = cache.get_stats("empty-bucket/").await.expect("stats");
        assert_eq!(
            empty,
            CacheStats {
                processed: 0,
                pending: 0,
                total_size: 0
            }
        );
    }

    #[tokio::test]
    async fn list_pending_dirs_filters_processed() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                entry("bucket/", true),
                entry("bucket/waiting/", false),
                entry("bucket/done/", true),
                entry("bucket/file.txt", false),
            ])
            .await
            .expect("insert");

        let pending = cache
            .list_pending_dirs("bucket/", 10)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "bucket/waiting/");

        let none = cache
            .list_pending_dirs("empty-bucket/", 10)
            .await
            .expect("pending");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn dangling_dirs_are_those_without_descendants() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                entry("bucket/", true),
                entry("bucket/empty/", true),
                entry("bucket/full/", true),
                entry("bucket/full/file.txt", true),
                entry("bucket/nested/", true),
                entry("bucket/nested/leaf/", true),
            ])
            .await
            .expect("insert");

        let dangling = cache
            .list_dangling_dirs("bucket/", 10)
            .await
            .expect("dangling");
        let paths: Vec<&str> = dangling.iter().map(|entry| entry.path.as_str()).collect();
        // Leaves first: descending order removes children before parents.
        assert_eq!(paths, vec!["bucket/nested/leaf/", "bucket/empty/"]);
    }

    #[tokio::test]
    async fn dangling_dirs_excludes_unprocessed() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[entry("bucket/", true), entry("bucket/pending/", false)])
            .await
            .expect("insert");
        let dangling = cache
            .list_dangling_dirs("bucket/", 10)
            .await
            .expect("dangling");
        assert!(dangling.is_empty());
    }

    #[tokio::test]
    async fn delete_dangling_files_removes_unprocessed() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                entry("bucket/keep.txt", true),
                entry("bucket/stale.txt", false),
                entry("bucket/staledir/", false),
            ])
            .await
            .expect("insert");

        let deleted = cache.delete_dangling_files("bucket/").await.expect("sweep");
        assert_eq!(deleted, 1);
        cache.stat("bucket/keep.txt").await.expect("kept");
        cache.stat("bucket/staledir/").await.expect("dirs untouched");
        assert!(cache.stat("bucket/stale.txt").await.is_err());

        let none = cache
            .delete_dangling_files("empty-bucket/")
            .await
            .expect("sweep");
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn set_processed_single_and_recursive() {
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                entry("bucket/", true),
                entry("bucket/a.txt", true),
                entry("bucket/sub/", true),
                entry("bucket/sub/b.txt", true),
            ])
            .await
            .expect("insert");

        let flipped = cache
            .set_processed("bucket/a.txt", false, false)
            .await
            .expect("set");
        assert_eq!(flipped, 1);
        assert!(!cache.stat("bucket/a.txt").await.expect("stat").processed);

        // Only rows whose flag differs are touched.
        let reset = cache
            .set_processed("bucket/", true, false)
            .await
            .expect("reset");
        assert_eq!(reset, 3);
        let stats = cache.get_stats("bucket/").await.expect("stats");
        assert_eq!(stats.pending, 4);

        let missing = cache
            .set_processed("nonexistent/file", false, true)
            .await
            .expect("set");
        assert_eq!(missing, 0);
    }

    #[tokio::test]
    async fn optimise_is_a_no_op() {
        let cache = seeded_cache().await;
        cache.optimise().await.expect("optimise");
        let (results, _) = cache.list("", "", false, 100).await.expect("list");
        assert_eq!(results.len(), FILE_STRUCTURE.len());
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let cache = seeded_cache().await;
        cache.close().await;
        assert!(cache.list("", "", false, 100).await.is_err());
        assert!(cache.stat("bucket-a/").await.is_err());
        assert!(cache.insert(&[entry("bucket-c/", true)]).await.is_err());
    }

    #[test]
    fn prefix_bound_is_exact() {
        assert_eq!(prefix_upper_bound("bucket/"), "bucket0");
        assert!("bucket/zzz" < "bucket0");
        assert!("bucket/" < "bucket0");
    }
}
