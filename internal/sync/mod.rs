use crate::cache::{Cache, CacheError};
use crate::fs::{EntryInfo, Fs, FsError};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MAX_PARALLEL: usize = 2;
const QUEUE_BATCH: i64 = 50;
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("backend error: {0}")]
    Backend(#[from] FsError),
}

/// Makes the cache converge with the backend tree for a single bucket,
/// resumably: the cache itself is the work queue, so an interrupted run
/// picks up where it left off.
pub struct Syncer {
    fs: Arc<dyn Fs>,
    cache: Cache,
    last_status: Mutex<Option<Instant>>,
}

impl Syncer {
    pub fn new(fs: Arc<dyn Fs>, cache: Cache) -> Self {
        Self {
            fs,
            cache,
            last_status: Mutex::new(None),
        }
    }

    pub async fn sync(&self, bucket: &str) -> Result<(), SyncError> {
        let start = Instant::now();
        let prefix = format!("{}/", bucket);

        let root_is_dir = matches!(self.cache.stat(&prefix).await, Ok(entry) if entry.is_dir);
        if !root_is_dir {
            self.cache
                .insert(&[EntryInfo {
                    path: prefix.clone(),
                    size: 0,
                    last_modified: Utc::now().timestamp(),
                    is_dir: true,
                    processed: false,
                }])
                .await?;
            tracing::info!(bucket, "sync: created root directory entry");
        }

        let stats = self.cache.get_stats(&prefix).await?;
        if stats.pending == 0 {
            tracing::info!(bucket, "sync: no unprocessed entries, skipping");
            return Ok(());
        }
        tracing::info!(
            bucket,
            processed = stats.processed,
            pending = stats.pending,
            "sync: starting"
        );

        self.run_walk_loop(&prefix).await;

        match self.cache.delete_dangling_files(&prefix).await {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(bucket, deleted, "sync: deleted old unprocessed entries");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(bucket, error = %err, "sync: failed to delete old entries");
            }
        }

        if let Ok(stats) = self.cache.get_stats(&prefix).await {
            tracing::info!(
                bucket,
                objects = stats.processed,
                total_mb = stats.total_size / 1024 / 1024,
                "sync: loaded objects into cache"
            );
        }
        tracing::info!(bucket, elapsed = ?start.elapsed(), "sync: completed");
        Ok(())
    }

    /// Fixed worker pool fed from the cache's pending-directory queue. The
    /// driver never blocks on a full dispatch channel without also draining
    /// completions, so worker slowness cannot deadlock it.
    async fn run_walk_loop(&self, prefix: &str) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<EntryInfo>(1);
        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let mut workers = Vec::with_capacity(MAX_PARALLEL);
        for _ in 0..MAX_PARALLEL {
            let fs = self.fs.clone();
            let cache = self.cache.clone();
            let dispatch_rx = dispatch_rx.clone();
            let done_tx = done_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let dir = { dispatch_rx.lock().await.recv().await };
                    let Some(dir) = dir else { break };
                    if let Err(err) = walk_dir(fs.as_ref(), &cache, &dir.path).await {
                        tracing::warn!(path = %dir.path, error = %err, "sync: error walking directory");
                    }
                    if done_tx.send(()).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        let mut in_flight = 0usize;
        loop {
            let mut queue = match self.cache.list_pending_dirs(prefix, QUEUE_BATCH).await {
                Ok(queue) => queue,
                Err(err) => {
                    tracing::warn!(error = %err, "sync: failed to list unprocessed directories");
                    break;
                }
            };
            if queue.is_empty() && in_flight == 0 {
                break;
            }

            while let Some(dir) = queue.last().cloned() {
                tokio::select! {
                    permit = dispatch_tx.reserve() => {
                        let Ok(permit) = permit else { break };
                        permit.send(dir);
                        queue.pop();
                        in_flight += 1;
                    }
                    done = done_rx.recv() => {
                        if done.is_none() {
                            break;
                        }
                        in_flight -= 1;
                    }
                }
                self.print_stats(prefix).await;
            }

            if in_flight > 0 {
                match done_rx.recv().await {
                    Some(()) => in_flight -= 1,
                    None => break,
                }
            }
        }

        drop(dispatch_tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Sweeps directories the cache believes are empty. Missing on the
    /// backend: drop the row. Non-empty on the backend: flag for re-walk.
    /// Actually empty: remove on the backend, then drop the row.
    pub async fn clean(&self, bucket: &str) -> Result<(), SyncError> {
        let start = Instant::now();
        let prefix = format!("{}/", bucket);
        let mut missing = 0u64;
        let mut removed = 0u64;
        let mut rescanned = 0u64;
        let mut errors = 0u64;

        loop {
            let dirs = self.cache.list_dangling_dirs(&prefix, QUEUE_BATCH).await?;
            if dirs.is_empty() {
                break;
            }
            for dir in dirs {
                self.clean_dir(&dir, &mut missing, &mut removed, &mut rescanned, &mut errors)
                    .await;
            }
            self.print_stats(&prefix).await;
        }

        tracing::info!(
            bucket,
            missing,
            removed,
            rescanned,
            errors,
            elapsed = ?start.elapsed(),
            "clean: completed"
        );
        Ok(())
    }

    async fn clean_dir(
        &self,
        dir: &EntryInfo,
        missing: &mut u64,
        removed: &mut u64,
        rescanned: &mut u64,
        errors: &mut u64,
    ) {
        match self.fs.read_dir(&dir.path).await {
            Err(err) if err.is_not_found() => {
                if let Err(err) = self.cache.delete(&dir.path).await {
                    tracing::warn!(path = %dir.path, error = %err, "clean: failed to delete missing dir");
                    *errors += 1;
                } else {
                    *missing += 1;
                }
            }
            Err(err) => {
                tracing::warn!(path = %dir.path, error = %err, "clean: failed to read dir");
                *errors += 1;
            }
            Ok(infos) if !infos.is_empty() => {
                // Children turned up: put the directory back on the queue.
                match self.cache.set_processed(&dir.path, false, false).await {
                    Ok(_) => *rescanned += 1,
                    Err(err) => {
                        tracing::warn!(path = %dir.path, error = %err, "clean: failed to mark dir unprocessed");
                        *errors += 1;
                    }
                }
            }
            Ok(_) => match self.fs.remove(&dir.path).await {
                Ok(()) => {
                    let _ = self.cache.delete(&dir.path).await;
                    *removed += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %dir.path, error = %err, "clean: failed to delete empty dir");
                    *errors += 1;
                }
            },
        }
    }

    async fn print_stats(&self, prefix: &str) {
        {
            let mut last = self.last_status.lock().expect("status lock");
            if matches!(*last, Some(at) if at.elapsed() < STATUS_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }
        if let Ok(stats) = self.cache.get_stats(prefix).await {
            tracing::info!(
                processed = stats.processed,
                queued = stats.pending,
                total_mb = stats.total_size / 1024 / 1024,
                "sync: progress"
            );
        }
    }
}

/// Enumerates one directory into the cache, then closes it out with the
/// durable processed flag. A directory missing on the backend is marked
/// processed rather than deleted; `clean` reconciles it later.
pub(crate) async fn walk_dir(fs: &dyn Fs, cache: &Cache, path: &str) -> Result<(), SyncError> {
    // Skip entries another worker already finished.
    if let Ok(entry) = cache.stat(path).await {
        if !entry.is_dir || entry.processed {
            return Ok(());
        }
    }

    let infos = match fs.read_dir(path).await {
        Err(err) if err.is_not_found() => {
            cache.set_processed(path, false, true).await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
        Ok(infos) => infos,
    };

    let base = path.trim_end_matches('/');
    let mut batch = Vec::with_capacity(infos.len());
    for info in infos {
        let mut full_path = format!("{}/{}", base, info.name).replace('\\', "/");
        if info.is_dir {
            full_path.push('/');
        }
        batch.push(EntryInfo {
            path: full_path,
            size: info.size,
            last_modified: info.modified,
            is_dir: info.is_dir,
            // File observation is terminal; directories stay work items.
            processed: !info.is_dir,
        });
    }

    cache.insert(&batch).await?;
    cache.set_processed(path, false, true).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFs;

    fn syncer(fs: Arc<MockFs>, cache: &Cache) -> Syncer {
        Syncer::new(fs, cache.clone())
    }

    fn dir_entry(path: &str, processed: bool) -> EntryInfo {
        EntryInfo {
            path: path.to_string(),
            size: 0,
            last_modified: 1_700_000_000,
            is_dir: true,
            processed,
        }
    }

    fn file_entry(path: &str, processed: bool) -> EntryInfo {
        EntryInfo {
            path: path.to_string(),
            size: 8,
            last_modified: 1_700_000_000,
            is_dir: false,
            processed,
        }
    }

    #[tokio::test]
    async fn sync_creates_root_for_empty_bucket() {
        let fs = Arc::new(MockFs::new());
        let cache = Cache::connect_in_memory().await.expect("cache");
        syncer(fs, &cache).sync("empty-bucket").await.expect("sync");

        let root = cache.stat("empty-bucket/").await.expect("root");
        assert!(root.is_dir);
        let stats = cache.get_stats("empty-bucket/").await.expect("stats");
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn sync_walks_nested_tree() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("test-bucket/file1.txt", b"content1").await;
        fs.add_file("test-bucket/dir1/file2.txt", b"content2").await;
        fs.add_file("test-bucket/dir1/subdir/file3.txt", b"content3")
            .await;
        fs.add_file("test-bucket/dir2/file4.txt", b"content4").await;

        let cache = Cache::connect_in_memory().await.expect("cache");
        syncer(fs, &cache).sync("test-bucket").await.expect("sync");

        let stats = cache.get_stats("test-bucket/").await.expect("stats");
        assert_eq!(stats.pending, 0);
        // 4 files + root + dir1 + dir1/subdir + dir2.
        assert_eq!(stats.processed, 8);

        let entry = cache
            .stat("test-bucket/dir1/subdir/file3.txt")
            .await
            .expect("file");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 8);

        cache.stat("test-bucket/dir1/subdir/").await.expect("dir row");
    }

    #[tokio::test]
    async fn sync_skips_when_nothing_pending() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("test-bucket/file1.txt", b"content1").await;
        let cache = Cache::connect_in_memory().await.expect("cache");
        let syncer = syncer(fs, &cache);

        syncer.sync("test-bucket").await.expect("first sync");
        let before = cache.get_stats("test-bucket/").await.expect("stats");
        assert_eq!(before.pending, 0);
        assert_eq!(before.processed, 2);

        syncer.sync("test-bucket").await.expect("second sync");
        let after = cache.get_stats("test-bucket/").await.expect("stats");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn sync_picks_up_new_files_after_reset() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("test-bucket/file1.txt", b"content1").await;
        let cache = Cache::connect_in_memory().await.expect("cache");
        let syncer = syncer(fs.clone(), &cache);

        syncer.sync("test-bucket").await.expect("first sync");
        let before = cache.get_stats("test-bucket/").await.expect("stats");

        fs.add_file("test-bucket/file2.txt", b"content2").await;
        cache
            .set_processed("test-bucket/", true, false)
            .await
            .expect("reset");

        syncer.sync("test-bucket").await.expect("second sync");
        let after = cache.get_stats("test-bucket/").await.expect("stats");
        assert_eq!(after.pending, 0);
        assert!(after.processed > before.processed);
        cache.stat("test-bucket/file2.txt").await.expect("new file");
    }

    #[tokio::test]
    async fn sync_sweeps_files_not_reobserved() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("b/y", b"still here").await;

        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[
                dir_entry("b/", false),
                file_entry("b/x", false),
                file_entry("b/y", true),
            ])
            .await
            .expect("seed");

        syncer(fs, &cache).sync("b").await.expect("sync");

        assert!(cache.stat("b/x").await.is_err(), "stale file swept");
        cache.stat("b/y").await.expect("kept");
        cache.stat("b/").await.expect("root kept");
        let stats = cache.get_stats("b/").await.expect("stats");
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn sync_handles_wide_trees_concurrently() {
        let fs = Arc::new(MockFs::new());
        for dir in 0..10 {
            for file in 0..10 {
                let path = format!("test-bucket/dir{}/file{}.txt", dir, file);
                fs.add_file(&path, b"content").await;
            }
        }
        let cache = Cache::connect_in_memory().await.expect("cache");
        syncer(fs, &cache).sync("test-bucket").await.expect("sync");

        let stats = cache.get_stats("test-bucket/").await.expect("stats");
        assert_eq!(stats.pending, 0);
        // 100 files + 10 dirs + root.
        assert_eq!(stats.processed, 111);
    }

    #[tokio::test]
    async fn walk_dir_skips_processed_and_non_dirs() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("b/dir/file.txt", b"content").await;
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[dir_entry("b/", true), dir_entry("b/dir/", true)])
            .await
            .expect("seed");

        walk_dir(fs.as_ref(), &cache, "b/dir/").await.expect("walk");
        // Already processed: the child file was not enumerated.
        assert!(cache.stat("b/dir/file.txt").await.is_err());
    }

    #[tokio::test]
    async fn walk_dir_marks_missing_dir_processed() {
        let fs = Arc::new(MockFs::new());
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[dir_entry("b/", true), dir_entry("b/gone/", false)])
            .await
            .expect("seed");

        walk_dir(fs.as_ref(), &cache, "b/gone/").await.expect("walk");
        // The row survives, flagged processed; clean reconciles it later.
        let entry = cache.stat("b/gone/").await.expect("row kept");
        assert!(entry.processed);
    }

    #[tokio::test]
    async fn clean_removes_empty_directory() {
        let fs = Arc::new(MockFs::new());
        fs.add_dir("b/empty").await;
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[dir_entry("b/", false), dir_entry("b/empty/", true)])
            .await
            .expect("seed");

        syncer(fs.clone(), &cache).clean("b").await.expect("clean");

        assert!(cache.stat("b/empty/").await.is_err(), "row gone");
        assert!(fs.removed_paths().await.contains(&"b/empty/".to_string()));
    }

    #[tokio::test]
    async fn clean_drops_rows_for_missing_directories() {
        let fs = Arc::new(MockFs::new());
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[dir_entry("b/", false), dir_entry("b/missing/", true)])
            .await
            .expect("seed");

        syncer(fs, &cache).clean("b").await.expect("clean");
        assert!(cache.stat("b/missing/").await.is_err());
    }

    #[tokio::test]
    async fn clean_requeues_directories_with_children() {
        let fs = Arc::new(MockFs::new());
        fs.add_file("b/dir/late.txt", b"content").await;
        let cache = Cache::connect_in_memory().await.expect("cache");
        cache
            .insert(&[dir_entry("b/", false), dir_entry("b/dir/", true)])
            .await
            .expect("seed");

        syncer(fs.clone(), &cache).clean("b").await.expect("clean");

        let entry = cache.stat("b/dir/").await.expect("row kept");
        assert!(!entry.processed, "flagged for re-walk");
        assert!(fs.removed_paths().await.is_empty());
    }
}
