use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;

pub mod local;
pub mod webdav;

pub use local::LocalFs;
pub use webdav::WebDavFs;

/// Streamed object bytes, both directions.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {path}")]
    Status { path: String, status: u16 },
    #[error("path escapes root directory: {0}")]
    PathEscape(String),
    #[error("{0}")]
    Other(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound(_) => true,
            FsError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            FsError::Status { status, .. } => *status == 404,
            FsError::Http(err) => err.status().map(|code| code.as_u16()) == Some(404),
            _ => false,
        }
    }
}

/// Metadata for a single backend child, as returned by `read_dir` and `stat`.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub modified: i64,
    pub is_dir: bool,
}

/// A cache entry. Directory paths end with `/`, file paths do not, and no
/// path starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: String,
    pub size: i64,
    pub last_modified: i64,
    pub is_dir: bool,
    pub processed: bool,
}

/// Capability surface over the remote hierarchical filesystem.
#[async_trait]
pub trait Fs: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, FsError>;
    async fn stat(&self, path: &str) -> Result<FileInfo, FsError>;
    async fn read_stream(&self, path: &str) -> Result<ByteStream, FsError>;
    async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        content_length: Option<u64>,
        mode: u32,
    ) -> Result<(), FsError>;
    async fn remove(&self, path: &str) -> Result<(), FsError>;
}

/// Splits a cache path into bucket and key. The first non-empty segment is
/// the bucket, the rest (rejoined) is the key.
pub fn bucket_and_key_from_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let bucket = parts.next().unwrap_or("");
    if bucket.is_empty() {
        return None;
    }
    let key = parts.next().unwrap_or("");
    Some((bucket.to_string(), key.to_string()))
}

pub fn path_from_bucket_and_key(bucket: &str, key: &str) -> String {
    if bucket.is_empty() {
        return String::new();
    }
    if key.is_empty() {
        return bucket.to_string();
    }
    format!("{}/{}", bucket, key)
}

/// All ancestor directory entries of `path`, nearest first, down to the
/// bucket root. Used to materialise missing parents on PUT.
pub fn base_dir_entries(path: &str, last_modified: i64) -> Vec<EntryInfo> {
    let mut entries = Vec::new();
    let mut current = path.trim_end_matches('/');
    while let Some(pos) = current.rfind('/') {
        current = &current[..pos];
        if current.is_empty() {
            break;
        }
        entries.push(EntryInfo {
            path: format!("{}/", current),
            size: 0,
            last_modified,
            is_dir: true,
            processed: true,
        });
    }
    entries
}
