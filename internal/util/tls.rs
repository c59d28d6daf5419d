use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const VALIDITY_DAYS: i64 = 10 * 365;

/// Returns the certificate/key pair under `dir`, generating a self-signed
/// RSA-2048 certificate on first use.
pub async fn get_or_create_certificates(dir: &Path) -> Result<(PathBuf, PathBuf), String> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        tracing::info!(dir = %dir.display(), "tls: found existing certificates");
        return Ok((cert_path, key_path));
    }

    tracing::info!(dir = %dir.display(), "tls: generating new self-signed certificate");
    fs::create_dir_all(dir)
        .await
        .map_err(|err| format!("failed to create certificate directory: {}", err))?;

    let (cert_pem, key_pem) = generate_self_signed_pem()?;
    fs::write(&cert_path, cert_pem)
        .await
        .map_err(|err| format!("failed to write certificate file: {}", err))?;
    fs::write(&key_path, key_pem)
        .await
        .map_err(|err| format!("failed to write key file: {}", err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|err| format!("failed to restrict key permissions: {}", err))?;
    }

    Ok((cert_path, key_path))
}

fn generate_self_signed_pem() -> Result<(String, String), String> {
    // rcgen cannot generate RSA keys itself; derive one and hand it over as
    // PKCS#8.
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
        .map_err(|err| format!("failed to generate RSA key: {}", err))?;
    let key_der = private_key
        .to_pkcs8_der()
        .map_err(|err| format!("failed to encode RSA key: {}", err))?;
    let key_pair = KeyPair::try_from(key_der.as_bytes())
        .map_err(|err| format!("failed to load RSA key: {}", err))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "S3 Filesystem Bridge");
    dn.push(DnType::OrganizationalUnitName, "Self-Signed Certificate");
    dn.push(DnType::CountryName, "US");
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names()?;
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(VALIDITY_DAYS);

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|err| format!("failed to create certificate: {}", err))?;
    Ok((certificate.pem(), key_pair.serialize_pem()))
}

fn subject_alt_names() -> Result<Vec<SanType>, String> {
    let dns_names = ["localhost", "sfb", "*.sfb"];
    let mut sans = Vec::new();
    for name in dns_names {
        let name = name
            .try_into()
            .map_err(|_| format!("invalid SAN: {}", name))?;
        sans.push(SanType::DnsName(name));
    }
    sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
    sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
    Ok(sans)
}

/// SHA-256 fingerprint of the first certificate in a PEM file, formatted as
/// colon-separated uppercase hex pairs.
pub fn certificate_fingerprint(cert_path: &Path) -> Result<String, String> {
    let pem = std::fs::read(cert_path)
        .map_err(|err| format!("failed to read certificate file: {}", err))?;
    let mut reader = BufReader::new(&pem[..]);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| "no certificate found in PEM file".to_string())?
        .map_err(|err| format!("invalid certificate format: {}", err))?;

    let digest = Sha256::digest(cert.as_ref());
    let pairs: Vec<String> = digest
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect();
    Ok(pairs.join(":"))
}
