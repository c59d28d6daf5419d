use axum_server::tls_rustls::RustlsConfig;
use sfb_core::cache::Cache;
use sfb_core::fs::{Fs, LocalFs, WebDavFs};
use sfb_core::s3::{self, AppState, AuthKeys};
use sfb_core::sync::Syncer;
use sfb_core::util::config::Config;
use sfb_core::util::secrets::get_or_create_secret;
use sfb_core::util::shutdown::shutdown_signal;
use sfb_core::util::tls::{certificate_fingerprint, get_or_create_certificates};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    install_crypto_provider();

    let config = Config::load();
    config.validate()?;
    let buckets = config.bucket_names();

    let fs = build_backend(&config).await?;
    tokio::fs::create_dir_all(&config.persist_dir).await?;
    let cache = Cache::connect(config.persist_dir.join("metadata.db")).await?;
    let syncer = Syncer::new(fs.clone(), cache.clone());

    if config.rescan {
        for bucket in &buckets {
            cache
                .set_processed(&format!("{}/", bucket), true, false)
                .await?;
        }
    }

    if config.scan || config.rescan {
        for bucket in &buckets {
            syncer.sync(bucket).await?;
        }
    }

    if config.rescan {
        tracing::info!("rescan: completed for all buckets");
        return Ok(());
    }

    if config.clean {
        for bucket in &buckets {
            syncer.clean(bucket).await?;
        }
        tracing::info!("clean: completed for all buckets");
        return Ok(());
    }

    if !config.serve {
        return Ok(());
    }

    run_serve(config, cache, fs, buckets).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn install_crypto_provider() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring crypto provider");
}

async fn build_backend(config: &Config) -> Result<Arc<dyn Fs>, Box<dyn std::error::Error>> {
    if let Some(local_path) = &config.local_path {
        tracing::info!(path = %local_path.display(), "starting S3-to-local bridge server");
        return Ok(Arc::new(LocalFs::new(local_path.clone()).await?));
    }
    let url = config.webdav_url.as_deref().unwrap_or_default();
    let user = config.webdav_user.as_deref().unwrap_or_default();
    let password = config.webdav_password.as_deref().unwrap_or_default();
    tracing::info!(url, user, "starting S3-to-WebDAV bridge server");
    let fs = WebDavFs::connect(url, user, password, config.webdav_insecure).await?;
    Ok(Arc::new(fs))
}

async fn load_auth_keys(config: &Config) -> Result<AuthKeys, Box<dyn std::error::Error>> {
    if config.aws_access_insecure {
        tracing::info!("s3: authentication disabled");
        return Ok(AuthKeys::default());
    }

    if let (Some(access_key), Some(secret_key)) = (&config.aws_access_key, &config.aws_secret_key)
    {
        tracing::info!(access_key = %access_key, "s3: using provided credentials");
        return Ok(AuthKeys::new(access_key, secret_key));
    }

    let access_key =
        get_or_create_secret(&config.persist_dir.join("access_key"), 20).await?;
    let secret_key =
        get_or_create_secret(&config.persist_dir.join("secret_key"), 20).await?;
    tracing::info!(
        dir = %config.persist_dir.display(),
        access_key = %access_key,
        "s3: generated/loaded credentials"
    );
    Ok(AuthKeys::new(access_key, secret_key))
}

async fn load_certs(config: &Config) -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    if config.tls_cert.is_some() || config.tls_key.is_some() {
        let cert = config.tls_cert.clone().ok_or("TLS certificate path is missing")?;
        let key = config.tls_key.clone().ok_or("TLS key path is missing")?;
        return Ok((cert, key));
    }
    Ok(get_or_create_certificates(&config.persist_dir).await?)
}

async fn run_serve(
    config: Config,
    cache: Cache,
    fs: Arc<dyn Fs>,
    buckets: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let auth = load_auth_keys(&config).await?;
    if config.read_only {
        tracing::info!("read-only: write operations are disabled");
    }

    let state = AppState {
        cache,
        fs,
        auth,
        buckets: Arc::new(buckets.into_iter().collect::<BTreeSet<String>>()),
        read_only: config.read_only,
        browser: config.browser,
    };
    let router = s3::router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;

    if config.http_only {
        tracing::info!(port = config.http_port, "http: server ready");
        tokio::select! {
            result = axum_server::bind(addr).serve(router.into_make_service()) => result?,
            _ = shutdown_signal() => tracing::info!("shutdown signal received"),
        }
        return Ok(());
    }

    let (cert_path, key_path) = load_certs(&config).await?;
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "tls: certificate loaded"
    );
    if let Ok(fingerprint) = certificate_fingerprint(&cert_path) {
        tracing::info!(fingerprint = %fingerprint, "tls: certificate fingerprint");
    }

    let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path).await?;
    tracing::info!(port = config.http_port, "https: server ready");
    tokio::select! {
        result = axum_server::bind_rustls(addr, tls_config).serve(router.into_make_service()) => result?,
        _ = shutdown_signal() => tracing::info!("shutdown signal received"),
    }
    Ok(())
}
