use rand::RngCore;
use std::io;
use std::path::Path;
use tokio::fs;

/// Reads the secret stored at `path`, generating and persisting
/// `length` random bytes (hex-encoded) on first use.
pub async fn get_or_create_secret(path: &Path, length: usize) -> io::Result<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::read_to_string(path).await {
        Ok(existing) => return Ok(existing.trim().to_string()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);

    fs::write(path, &secret).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(secret)
}
