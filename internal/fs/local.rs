use crate::fs::{ByteStream, FileInfo, Fs, FsError};
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Backend over a local mount. Paths are resolved relative to the root and
/// may not escape it.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, FsError> {
        let relative = Path::new(path.trim_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(FsError::PathEscape(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

fn file_info(name: String, meta: &std::fs::Metadata) -> FileInfo {
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    FileInfo {
        name,
        size: if meta.is_dir() { 0 } else { meta.len() as i64 },
        modified,
        is_dir: meta.is_dir(),
    }
}

#[async_trait]
impl Fs for LocalFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, FsError> {
        let full = self.full_path(path)?;
        let mut dir = fs::read_dir(&full).await?;
        let mut infos = Vec::new();
        while let Some(dirent) = dir.next_entry().await? {
            let meta = dirent.metadata().await?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            infos.push(file_info(name, &meta));
        }
        Ok(infos)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let full = self.full_path(path)?;
        let meta = fs::metadata(&full).await?;
        let name = full
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(file_info(name, &meta))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, FsError> {
        let full = self.full_path(path)?;
        let file = fs::File::open(&full).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _content_length: Option<u64>,
        mode: u32,
    ) -> Result<(), FsError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = full.with_extension(format!("tmp{:08x}", rand::thread_rng().gen::<u32>()));
        let result = write_temp_file(&temp, &mut stream, mode).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        fs::rename(&temp, &full).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        let full = self.full_path(path)?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            fs::remove_dir(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }
}

async fn write_temp_file(
    temp: &Path,
    stream: &mut ByteStream,
    mode: u32,
) -> Result<(), FsError> {
    let mut file = fs::File::create(temp).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if mode != 0 {
            file.set_permissions(std::fs::Permissions::from_mode(mode))
                .await?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn byte_stream(data: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![Ok(bytes::Bytes::from_static(data))]))
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        out
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFs::new(dir.path()).await.expect("local fs");
        fs.write_stream("bucket/a/file.txt", byte_stream(b"hello"), Some(5), 0o644)
            .await
            .expect("write");

        let info = fs.stat("bucket/a/file.txt").await.expect("stat");
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);

        let body = collect(fs.read_stream("bucket/a/file.txt").await.expect("read")).await;
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn read_dir_lists_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFs::new(dir.path()).await.expect("local fs");
        fs.write_stream("bucket/one.txt", byte_stream(b"1"), None, 0o644)
            .await
            .expect("write");
        fs.write_stream("bucket/sub/two.txt", byte_stream(b"22"), None, 0o644)
            .await
            .expect("write");

        let mut names: Vec<String> = fs
            .read_dir("bucket")
            .await
            .expect("read dir")
            .into_iter()
            .map(|info| info.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one.txt", "sub"]);
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFs::new(dir.path()).await.expect("local fs");
        let err = fs.stat("bucket/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remove_file_and_empty_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFs::new(dir.path()).await.expect("local fs");
        fs.write_stream("bucket/sub/file.txt", byte_stream(b"x"), None, 0o644)
            .await
            .expect("write");

        fs.remove("bucket/sub/file.txt").await.expect("remove file");
        fs.remove("bucket/sub").await.expect("remove dir");
        assert!(fs.stat("bucket/sub").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = LocalFs::new(dir.path()).await.expect("local fs");
        let err = fs.stat("../outside").await.unwrap_err();
        assert!(matches!(err, FsError::PathEscape(_)));
    }
}
