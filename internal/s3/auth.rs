use crate::access_log;
use crate::s3::sig;
use crate::s3::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;
use url::form_urlencoded;

const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// S3 credentials the gateway accepts. Empty access key disables
/// authentication entirely.
#[derive(Debug, Clone, Default)]
pub struct AuthKeys {
    pub access_key: String,
    pub secret_key: String,
}

impl AuthKeys {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.access_key.is_empty()
    }
}

pub(crate) struct RequestFacts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub raw_query: &'a str,
    pub headers: &'a HeaderMap,
    pub host: &'a str,
}

/// Tries the four AWS verification paths in order; the first accept wins.
pub async fn middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.auth.enabled() {
        return next.run(req).await;
    }
    if state.browser && req.uri().path().starts_with("/-/browser/") {
        return next.run(req).await;
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let facts = RequestFacts {
        method: req.method().as_str(),
        path: req.uri().path(),
        raw_query: req.uri().query().unwrap_or(""),
        headers: req.headers(),
        host: &host,
    };

    match verify(&state.auth, &facts) {
        Some(scheme) => {
            let mut response = next.run(req).await;
            access_log::add_context(&mut response, scheme);
            response
        }
        None => {
            let mut response = (StatusCode::UNAUTHORIZED, "Authorization failed\n").into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, "AWS".parse().expect("header"));
            access_log::add_context(&mut response, "auth-fail");
            response
        }
    }
}

pub(crate) fn verify(keys: &AuthKeys, facts: &RequestFacts<'_>) -> Option<&'static str> {
    if validate_presigned_v2(keys, facts) {
        return Some("presigned-v2");
    }
    if validate_presigned_v4(keys, facts) {
        return Some("presigned-v4");
    }
    if validate_authorization_v2(keys, facts) {
        return Some("auth-v2");
    }
    if validate_authorization_v4(keys, facts) {
        return Some("auth-v4");
    }
    None
}

fn query_map(raw_query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Recomputes the v2 signature for a request, with `date` being either the
/// `Date` header (header form) or the `Expires` value (presigned form).
fn calculate_v2(keys: &AuthKeys, facts: &RequestFacts<'_>, date: &str) -> String {
    let resource = sig::canonical_resource_v2(facts.path, facts.raw_query);
    sig::signature_v2(
        &keys.secret_key,
        facts.method,
        header_value(facts.headers, "content-md5"),
        header_value(facts.headers, "content-type"),
        date,
        &resource,
    )
}

fn validate_presigned_v2(keys: &AuthKeys, facts: &RequestFacts<'_>) -> bool {
    let query = query_map(facts.raw_query);
    let (Some(access_key), Some(signature), Some(expires)) = (
        query.get("AWSAccessKeyId"),
        query.get("Signature"),
        query.get("Expires"),
    ) else {
        return false;
    };
    if access_key != &keys.access_key {
        return false;
    }
    let Ok(expires_at) = expires.parse::<i64>() else {
        return false;
    };
    if Utc::now().timestamp() > expires_at {
        return false;
    }
    calculate_v2(keys, facts, expires) == *signature
}

fn validate_authorization_v2(keys: &AuthKeys, facts: &RequestFacts<'_>) -> bool {
    let auth_header = header_value(facts.headers, "authorization");
    let Some(rest) = auth_header.strip_prefix("AWS ") else {
        return false;
    };
    let mut parts = rest.splitn(2, ':');
    let access_key = parts.next().unwrap_or("");
    let Some(signature) = parts.next() else {
        return false;
    };
    if access_key != keys.access_key {
        return false;
    }
    let date = header_value(facts.headers, "date");
    calculate_v2(keys, facts, date) == signature
}

fn validate_presigned_v4(keys: &AuthKeys, facts: &RequestFacts<'_>) -> bool {
    let query = query_map(facts.raw_query);
    let (Some(credential), Some(signature), Some(signed_headers), Some(expires), Some(date)) = (
        query.get("X-Amz-Credential"),
        query.get("X-Amz-Signature"),
        query.get("X-Amz-SignedHeaders"),
        query.get("X-Amz-Expires"),
        query.get("X-Amz-Date"),
    ) else {
        return false;
    };
    let Some(credential) = sig::parse_credential(credential) else {
        return false;
    };
    if credential.access_key != keys.access_key {
        return false;
    }
    let Ok(expires_seconds) = expires.parse::<i64>() else {
        return false;
    };
    let Ok(request_time) = NaiveDateTime::parse_from_str(date, AMZ_DATE_FORMAT) else {
        return false;
    };
    let request_time = Utc.from_utc_datetime(&request_time);
    if Utc::now() > request_time + Duration::seconds(expires_seconds) {
        return false;
    }
    let payload_hash = query
        .get("X-Amz-Content-Sha256")
        .map(String::as_str)
        .unwrap_or(sig::UNSIGNED_PAYLOAD);
    let expected = sig::signature_v4(
        &keys.secret_key,
        credential.region,
        credential.service,
        date,
        facts.method,
        facts.path,
        facts.raw_query,
        facts.headers,
        facts.host,
        signed_headers,
        payload_hash,
        true,
    );
    expected.as_deref() == Some(signature.as_str())
}

fn validate_authorization_v4(keys: &AuthKeys, facts: &RequestFacts<'_>) -> bool {
    let auth_header = header_value(facts.headers, "authorization");
    let Some(rest) = auth_header.strip_prefix("AWS4-HMAC-SHA256 ") else {
        return false;
    };
    let params = parse_auth_params(rest);
    let (Some(credential), Some(signature), Some(signed_headers)) = (
        params.get("Credential"),
        params.get("Signature"),
        params.get("SignedHeaders"),
    ) else {
        return false;
    };
    let Some(credential) = sig::parse_credential(credential) else {
        return false;
    };
    if credential.access_key != keys.access_key {
        return false;
    }
    let amz_date = header_value(facts.headers, "x-amz-date");
    if amz_date.is_empty() {
        return false;
    }
    let payload_hash = match header_value(facts.headers, "x-amz-content-sha256") {
        "" => sig::UNSIGNED_PAYLOAD,
        value => value,
    };
    let expected = sig::signature_v4(
        &keys.secret_key,
        credential.region,
        credential.service,
        amz_date,
        facts.method,
        facts.path,
        facts.raw_query,
        facts.headers,
        facts.host,
        signed_headers,
        payload_hash,
        false,
    );
    expected.as_deref() == Some(signature.as_str())
}

fn parse_auth_params(params: &str) -> HashMap<String, String> {
    params
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();
            let value = parts.next()?.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
