use crate::fs::{ByteStream, FileInfo, Fs, FsError};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

/// In-memory backend for tests: files in a map, directories implied by file
/// paths plus an explicit set for empty ones. Removals are recorded so tests
/// can assert on backend side effects.
#[derive(Default)]
pub struct MockFs {
    state: RwLock<MockState>,
}

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, MockFile>,
    dirs: BTreeSet<String>,
    removed: Vec<String>,
    fail_removes: bool,
}

struct MockFile {
    modified: i64,
    content: Vec<u8>,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state.write().await;
        state.files.insert(
            normalize(path),
            MockFile {
                modified: Utc::now().timestamp(),
                content: content.to_vec(),
            },
        );
    }

    pub async fn add_dir(&self, path: &str) {
        let mut state = self.state.write().await;
        state.dirs.insert(normalize(path));
    }

    pub async fn file(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.read().await;
        state.files.get(&normalize(path)).map(|file| file.content.clone())
    }

    pub async fn removed_paths(&self) -> Vec<String> {
        self.state.read().await.removed.clone()
    }

    pub async fn set_fail_removes(&self, fail: bool) {
        self.state.write().await.fail_removes = fail;
    }
}

fn dir_exists(state: &MockState, dir: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    if state.dirs.contains(dir) {
        return true;
    }
    let prefix = format!("{}/", dir);
    state.files.keys().any(|key| key.starts_with(&prefix))
        || state.dirs.iter().any(|key| key.starts_with(&prefix))
}

fn child_name(rest: &str) -> (&str, bool) {
    match rest.find('/') {
        Some(pos) => (&rest[..pos], true),
        None => (rest, false),
    }
}

#[async_trait]
impl Fs for MockFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, FsError> {
        let dir = normalize(path);
        let state = self.state.read().await;
        if !dir_exists(&state, &dir) {
            return Err(FsError::NotFound(path.to_string()));
        }

        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let mut children: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (key, file) in &state.files {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let (name, nested) = child_name(rest);
            children.entry(name.to_string()).or_insert_with(|| FileInfo {
                name: name.to_string(),
                size: if nested { 0 } else { file.content.len() as i64 },
                modified: file.modified,
                is_dir: nested,
            });
        }
        for key in &state.dirs {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let (name, _) = child_name(rest);
            children.entry(name.to_string()).or_insert_with(|| FileInfo {
                name: name.to_string(),
                size: 0,
                modified: 0,
                is_dir: true,
            });
        }
        Ok(children.into_values().collect())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let key = normalize(path);
        let state = self.state.read().await;
        if let Some(file) = state.files.get(&key) {
            let name = key.rsplit('/').next().unwrap_or_default().to_string();
            return Ok(FileInfo {
                name,
                size: file.content.len() as i64,
                modified: file.modified,
                is_dir: false,
            });
        }
        if dir_exists(&state, &key) {
            let name = key.rsplit('/').next().unwrap_or_default().to_string();
            return Ok(FileInfo {
                name,
                size: 0,
                modified: 0,
                is_dir: true,
            });
        }
        Err(FsError::NotFound(path.to_string()))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, FsError> {
        let key = normalize(path);
        let state = self.state.read().await;
        let file = state
            .files
            .get(&key)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let chunk = bytes::Bytes::from(file.content.clone());
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])))
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _content_length: Option<u64>,
        _mode: u32,
    ) -> Result<(), FsError> {
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FsError::Io)?;
            content.extend_from_slice(&chunk);
        }
        let mut state = self.state.write().await;
        state.files.insert(
            normalize(path),
            MockFile {
                modified: Utc::now().timestamp(),
                content,
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        let key = normalize(path);
        let mut state = self.state.write().await;
        if state.fail_removes {
            return Err(FsError::Other(format!("forced remove failure: {}", path)));
        }
        if state.files.remove(&key).is_some() {
            state.removed.push(path.to_string());
            return Ok(());
        }
        if dir_exists(&state, &key) {
            let prefix = format!("{}/", key);
            let has_children = state.files.keys().any(|entry| entry.starts_with(&prefix))
                || state.dirs.iter().any(|entry| entry.starts_with(&prefix));
            if has_children {
                return Err(FsError::Other(format!("directory not empty: {}", path)));
            }
            state.dirs.remove(&key);
            state.removed.push(path.to_string());
            return Ok(());
        }
        Err(FsError::NotFound(path.to_string()))
    }
}
