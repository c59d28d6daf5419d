use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// AWS v2 string-to-sign and HMAC-SHA1 signature, base64-encoded. Shared by
/// the Authorization-header and presigned forms; the presigned form passes
/// the `Expires` value as the date string.
pub fn signature_v2(
    secret: &str,
    method: &str,
    content_md5: &str,
    content_type: &str,
    date: &str,
    canonical_resource: &str,
) -> String {
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}\n{}",
        method, content_md5, content_type, date, canonical_resource
    );
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(string_to_sign.as_bytes());
    Base64.encode(mac.finalize().into_bytes())
}

/// The v2 canonical resource: the URL path (defaulting to `/`) with the raw
/// query appended verbatim when non-empty.
pub fn canonical_resource_v2(path: &str, raw_query: &str) -> String {
    let mut resource = if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    };
    if !raw_query.is_empty() {
        resource.push('?');
        resource.push_str(raw_query);
    }
    resource
}

/// Fields recovered from an `X-Amz-Credential` /
/// `Credential=` value of the form
/// `<key>/<yyyymmdd>/<region>/<service>/aws4_request`.
#[derive(Debug, PartialEq, Eq)]
pub struct Credential<'a> {
    pub access_key: &'a str,
    pub date: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

pub fn parse_credential(credential: &str) -> Option<Credential<'_>> {
    let parts: Vec<&str> = credential.split('/').collect();
    if parts.len() < 5 || parts[0].is_empty() {
        return None;
    }
    Some(Credential {
        access_key: parts[0],
        date: parts[1],
        region: parts[2],
        service: parts[3],
    })
}

/// Computes the v4 signature over a request, hex-encoded. `amz_date` is the
/// full `yyyymmddThhmmssZ` timestamp; its first eight characters scope the
/// signing key.
#[allow(clippy::too_many_arguments)]
pub fn signature_v4(
    secret: &str,
    region: &str,
    service: &str,
    amz_date: &str,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    host: &str,
    signed_headers: &str,
    payload_hash: &str,
    strip_signature_param: bool,
) -> Option<String> {
    if amz_date.len() < 8 {
        return None;
    }
    let date = &amz_date[..8];
    let canonical_request = canonical_request_v4(
        method,
        path,
        query,
        headers,
        host,
        signed_headers,
        payload_hash,
        strip_signature_param,
    );
    let credential_scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let hashed_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date, credential_scope, hashed_request
    );

    let mut key = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    key = hmac_sha256(&key, region.as_bytes());
    key = hmac_sha256(&key, service.as_bytes());
    key = hmac_sha256(&key, b"aws4_request");
    Some(hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())))
}

#[allow(clippy::too_many_arguments)]
pub fn canonical_request_v4(
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    host: &str,
    signed_headers: &str,
    payload_hash: &str,
    strip_signature_param: bool,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(path),
        canonical_query(query, strip_signature_param),
        canonical_headers(headers, host, signed_headers),
        signed_headers,
        payload_hash
    )
}

/// URI-encodes each path segment with the AWS unreserved set and collapses
/// duplicate slashes.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let encoded: Vec<String> = path.split('/').map(aws_uri_escape).collect();
    let mut canonical = encoded.join("/");
    if !canonical.starts_with('/') {
        canonical.insert(0, '/');
    }
    while canonical.contains("//") {
        canonical = canonical.replace("//", "/");
    }
    canonical
}

/// Percent-encodes and sorts the query pairs; `+` never survives as a space
/// encoding. The presigned form computes over the query minus its own
/// `X-Amz-Signature`.
fn canonical_query(query: &str, strip_signature_param: bool) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    if strip_signature_param {
        pairs.retain(|(key, _)| key != "X-Amz-Signature");
    }
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", aws_uri_escape(&key), aws_uri_escape(&value)))
        .collect::<Vec<String>>()
        .join("&")
}

/// One `name:value\n` line per signed header, in the order the client listed
/// them. A missing `Host` header falls back to the request host.
fn canonical_headers(headers: &HeaderMap, host: &str, signed_headers: &str) -> String {
    let mut out = String::new();
    for name in signed_headers.split(';') {
        let name = name.trim().to_lowercase();
        let value = headers
            .get(&name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let value = if value.is_empty() && name == "host" {
            host
        } else {
            value
        };
        out.push_str(&name);
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }
    out
}

fn aws_uri_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.as_bytes() {
        match *byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
