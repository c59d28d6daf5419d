use axum::extract::Request;
use axum::http::{HeaderMap, Version};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Local;
use std::time::Instant;

/// Per-request labels surfaced in the access log, e.g. the matched auth
/// scheme or the S3 operation. Stored as a response extension.
#[derive(Clone, Debug, Default)]
pub struct LogContext(pub Vec<String>);

pub fn add_context(response: &mut Response, label: impl Into<String>) {
    match response.extensions_mut().get_mut::<LogContext>() {
        Some(context) => context.0.push(label.into()),
        None => {
            response
                .extensions_mut()
                .insert(LogContext(vec![label.into()]));
        }
    }
}

/// Emits one Apache-combined-style line per request on the `access` target,
/// extended with request size, duration and context labels.
pub async fn middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();
    let remote_host = client_ip(req.headers());
    let remote_user = remote_user(req.headers());
    let request_size = content_length(req.headers());
    let referer = header_or_dash(req.headers(), "referer");
    let user_agent = header_or_dash(req.headers(), "user-agent");

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let response_size = content_length(response.headers());
    let context = response
        .extensions()
        .get::<LogContext>()
        .map(|context| format!(" [{}]", context.0.join(", ")))
        .unwrap_or_default();
    let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");

    tracing::info!(
        target: "access",
        "{} - {} [{}] \"{} {} {}\" {} {}/{} \"{}\" \"{}\" {}{}",
        remote_host,
        remote_user,
        timestamp,
        method,
        uri,
        version_label(version),
        status,
        request_size,
        response_size,
        referer,
        user_agent,
        start.elapsed().as_millis(),
        context,
    );

    response
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/?",
    }
}

fn header_or_dash(headers: &HeaderMap, name: &str) -> String {
    match headers.get(name).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => "-".to_string(),
    }
}

fn content_length(headers: &HeaderMap) -> String {
    headers
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

/// Client address: X-Forwarded-For first, then X-Real-IP, then `-`.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "-".to_string()
}

/// The v2 access key doubles as the logged remote user.
fn remote_user(headers: &HeaderMap) -> String {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if let Some(rest) = auth.strip_prefix("AWS ") {
        let key = rest.splitn(2, ':').next().unwrap_or("");
        if !key.is_empty() {
            return key.to_string();
        }
    }
    if let Some(rest) = auth.strip_prefix("AWS4-HMAC-SHA256 ") {
        if let Some(credential) = rest
            .split(',')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("Credential="))
        {
            let key = credential.split('/').next().unwrap_or("");
            if !key.is_empty() {
                return key.to_string();
            }
        }
    }
    "-".to_string()
}
