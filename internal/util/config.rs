use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Every option is a CLI flag with an environment-variable default. Boolean
/// flags take an explicit value (`--scan false`) so the environment form and
/// the flag form behave identically.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sfb",
    version,
    about = "S3 Filesystem Bridge: an S3-compatible gateway over WebDAV or a local mount"
)]
pub struct Config {
    /// WebDAV server URL
    #[arg(long, env = "WEBDAV_URL")]
    pub webdav_url: Option<String>,

    /// WebDAV username
    #[arg(long, env = "WEBDAV_USER")]
    pub webdav_user: Option<String>,

    /// WebDAV password
    #[arg(long, env = "WEBDAV_PASSWORD")]
    pub webdav_password: Option<String>,

    /// Allow self-signed certificates for WebDAV
    #[arg(long, env = "WEBDAV_INSECURE", default_value_t = false, action = ArgAction::Set)]
    pub webdav_insecure: bool,

    /// Local filesystem path (alternative to WebDAV)
    #[arg(long, env = "LOCAL_PATH")]
    pub local_path: Option<PathBuf>,

    /// S3 access key
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub aws_access_key: Option<String>,

    /// S3 secret key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY")]
    pub aws_secret_key: Option<String>,

    /// Allow insecure, secret-less access
    #[arg(long, env = "AWS_ACCESS_INSECURE", default_value_t = false, action = ArgAction::Set)]
    pub aws_access_insecure: bool,

    /// HTTP/HTTPS server port
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Serve plain HTTP instead of HTTPS
    #[arg(long, env = "HTTP_ONLY", default_value_t = false, action = ArgAction::Set)]
    pub http_only: bool,

    /// TLS certificate file path
    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS key file path
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Directory for persistent data (cache, keys, certificates)
    #[arg(long, env = "PERSIST_DIR", default_value = "./data")]
    pub persist_dir: PathBuf,

    /// Comma-separated list of bucket names to expose (required)
    #[arg(long, env = "BUCKETS", default_value = "")]
    pub buckets: String,

    /// Enable the built-in browser under /-/browser/
    #[arg(long, env = "BROWSER", default_value_t = false, action = ArgAction::Set)]
    pub browser: bool,

    /// Disable PUT and DELETE operations
    #[arg(long, env = "READ_ONLY", default_value_t = false, action = ArgAction::Set)]
    pub read_only: bool,

    /// Scan the backend into the cache on startup
    #[arg(long, env = "SCAN", default_value_t = true, action = ArgAction::Set)]
    pub scan: bool,

    /// Reset the cache state, re-scan every bucket, then exit
    #[arg(long, env = "RESCAN", default_value_t = false, action = ArgAction::Set)]
    pub rescan: bool,

    /// Remove empty directories from the backend, then exit
    #[arg(long, env = "CLEAN", default_value_t = false, action = ArgAction::Set)]
    pub clean: bool,

    /// Run the HTTP server after the startup scan
    #[arg(long, env = "SERVE", default_value_t = true, action = ArgAction::Set)]
    pub serve: bool,
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bucket_names().is_empty() {
            return Err(
                "bucket list is required (use --buckets or the BUCKETS environment variable)"
                    .to_string(),
            );
        }
        if self.persist_dir.as_os_str().is_empty() {
            return Err("persist directory is required".to_string());
        }
        match (&self.webdav_url, &self.local_path) {
            (Some(_), Some(_)) => {
                return Err("cannot use both WebDAV and a local path, choose one".to_string())
            }
            (None, None) => {
                return Err("either a WebDAV URL or a local path is required".to_string())
            }
            (Some(_), None) => {
                if self.webdav_user.is_none() || self.webdav_password.is_none() {
                    return Err("WebDAV username and password are required".to_string());
                }
            }
            (None, Some(_)) => {}
        }
        if self.aws_access_insecure
            && (self.aws_access_key.is_some() || self.aws_secret_key.is_some())
        {
            return Err(
                "cannot combine --aws-access-insecure with provided access or secret keys"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}
