use crate::access_log;
use crate::cache::Cache;
use crate::fs::{self, ByteStream, EntryInfo, Fs};
use crate::s3::digest::Sha256Verifier;
use crate::s3::errors::{s3_error, S3Error};
use crate::s3::xml::{DeleteError, ListArgs, ListV2Args, ObjectItem};
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use chrono::{TimeZone, Utc};
use futures_util::TryStreamExt;
use md5::{Digest, Md5};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use url::form_urlencoded;

pub mod auth;
mod digest;
pub mod errors;
pub mod sig;
pub mod xml;

pub use auth::AuthKeys;

const MAX_KEYS_LIMIT: i64 = 1000;
const BULK_DELETE_BODY_LIMIT: usize = 2 * 1024 * 1024;
const BROWSER_HTML: &str = include_str!("browser.html");

/// Shared handler state: the cache answers metadata questions, the backend
/// serves and accepts object bytes.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    pub fs: Arc<dyn Fs>,
    pub auth: AuthKeys,
    pub buckets: Arc<BTreeSet<String>>,
    pub read_only: bool,
    pub browser: bool,
}

impl AppState {
    fn bucket_allowed(&self, bucket: &str) -> bool {
        self.buckets.contains(bucket)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .route("/{*path}", any(path_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::middleware,
        ))
        .layer(axum::middleware::from_fn(access_log::middleware))
        .with_state(state)
}

async fn root_handler(State(state): State<AppState>, method: Method) -> Response {
    if method != Method::GET {
        return s3_error(S3Error::MethodNotAllowed);
    }
    let buckets: Vec<String> = state.buckets.iter().cloned().collect();
    let body = xml::list_buckets(&buckets, Utc::now().timestamp());
    let mut response = xml_ok(body);
    access_log::add_context(&mut response, "list-buckets");
    response
}

#[allow(clippy::too_many_arguments)]
async fn path_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Body,
) -> Response {
    let raw_query = raw_query.unwrap_or_default();
    if state.browser && path.starts_with("-/browser/") {
        return browser_page(&state, &path, &raw_query);
    }

    let query: HashMap<String, String> = serde_urlencoded::from_str(&raw_query).unwrap_or_default();
    let Some((bucket, key)) = fs::bucket_and_key_from_path(&path) else {
        return s3_error(S3Error::NoSuchBucket);
    };
    if !state.bucket_allowed(&bucket) {
        return s3_error(S3Error::NoSuchBucket);
    }

    let (result, op) = dispatch(&state, &bucket, &key, method, headers, &query, body).await;
    let mut response = result.unwrap_or_else(s3_error);
    access_log::add_context(&mut response, op);
    response
}

async fn dispatch(
    state: &AppState,
    bucket: &str,
    key: &str,
    method: Method,
    headers: HeaderMap,
    query: &HashMap<String, String>,
    body: Body,
) -> (Result<Response, S3Error>, String) {
    if key.is_empty() {
        return dispatch_bucket(state, bucket, method, query, body).await;
    }
    match method {
        Method::HEAD => (
            head_object(state, bucket, key, &headers).await,
            format!("head:{}/{}", bucket, key),
        ),
        Method::GET => (
            get_object(state, bucket, key, &headers).await,
            format!("get:{}/{}", bucket, key),
        ),
        Method::PUT if state.read_only => (
            Err(S3Error::MethodNotAllowed),
            format!("put:{}/{}", bucket, key),
        ),
        Method::PUT => (
            put_object(state, bucket, key, &headers, body).await,
            format!("put:{}/{}", bucket, key),
        ),
        Method::DELETE if state.read_only => (
            Err(S3Error::MethodNotAllowed),
            format!("delete:{}/{}", bucket, key),
        ),
        Method::DELETE => (
            delete_object(state, bucket, key).await,
            format!("delete:{}/{}", bucket, key),
        ),
        _ => (
            Err(S3Error::MethodNotAllowed),
            format!("{}:{}/{}", method.as_str().to_lowercase(), bucket, key),
        ),
    }
}

async fn dispatch_bucket(
    state: &AppState,
    bucket: &str,
    method: Method,
    query: &HashMap<String, String>,
    body: Body,
) -> (Result<Response, S3Error>, String) {
    match method {
        Method::HEAD => (
            Ok(StatusCode::OK.into_response()),
            format!("head-bucket:{}", bucket),
        ),
        Method::GET => {
            let label = if query.get("list-type").map(String::as_str) == Some("2") {
                format!("list-objects-v2:{}", bucket)
            } else {
                format!("list-objects:{}", bucket)
            };
            (list_objects(state, bucket, query).await, label)
        }
        Method::POST if query.contains_key("delete") && !state.read_only => (
            bulk_delete(state, bucket, body).await,
            format!("bulk-delete:{}", bucket),
        ),
        _ => (
            Err(S3Error::MethodNotAllowed),
            format!("{}:{}", method.as_str().to_lowercase(), bucket),
        ),
    }
}

/// ETag synthesised from metadata, not content. Stable for unchanged
/// objects across restarts; never the MD5 of the bytes.
pub fn generate_etag(path: &str, size: i64, last_modified: i64) -> String {
    let digest = Md5::digest(format!("{}-{}-{}", path, size, last_modified).as_bytes());
    format!("\"{}\"", hex::encode(digest))
}

fn http_date(unix_seconds: i64) -> String {
    Utc.timestamp_opt(unix_seconds, 0)
        .single()
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn xml_ok(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

async fn list_objects(
    state: &AppState,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let is_v2 = query.get("list-type").map(String::as_str) == Some("2");
    let s3_prefix = query.get("prefix").cloned().unwrap_or_default();
    let continuation_token = query.get("continuation-token").cloned().unwrap_or_default();
    let start_after = query.get("start-after").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned().unwrap_or_default();

    // Markers and continuation tokens are cache-namespace paths fed back
    // verbatim; start-after is bucket-relative and needs the bucket prefix.
    let marker = if is_v2 {
        if !continuation_token.is_empty() {
            continuation_token.clone()
        } else if !start_after.is_empty() {
            format!("{}/{}", bucket, start_after)
        } else {
            String::new()
        }
    } else {
        query.get("marker").cloned().unwrap_or_default()
    };

    let max_keys = query
        .get("max-keys")
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0 && *value <= MAX_KEYS_LIMIT)
        .unwrap_or(MAX_KEYS_LIMIT);

    let cache_prefix = if s3_prefix.is_empty() {
        format!("{}/", bucket)
    } else {
        format!("{}/{}", bucket, s3_prefix)
    };

    let (entries, is_truncated) = state
        .cache
        .list(&cache_prefix, &marker, !delimiter.is_empty(), max_keys)
        .await
        .map_err(|err| {
            tracing::warn!(bucket, error = %err, "list objects failed");
            S3Error::InternalError
        })?;

    let bucket_prefix = format!("{}/", bucket);
    let mut contents = Vec::new();
    let mut common_prefixes = Vec::new();
    for entry in &entries {
        let key = entry
            .path
            .strip_prefix(&bucket_prefix)
            .unwrap_or(&entry.path)
            .to_string();
        if entry.is_dir {
            common_prefixes.push(key);
        } else {
            contents.push(ObjectItem {
                etag: generate_etag(&entry.path, entry.size, entry.last_modified),
                key,
                last_modified: entry.last_modified,
                size: entry.size,
            });
        }
    }
    let next_marker = if is_truncated {
        entries
            .last()
            .map(|entry| entry.path.clone())
            .unwrap_or_default()
    } else {
        String::new()
    };

    let list = ListArgs {
        bucket,
        prefix: &s3_prefix,
        marker: &marker,
        delimiter: &delimiter,
        max_keys,
        is_truncated,
        next_marker: &next_marker,
        contents: &contents,
        common_prefixes: &common_prefixes,
    };
    let body = if is_v2 {
        xml::list_bucket_result_v2(&ListV2Args {
            list,
            continuation_token: &continuation_token,
            start_after: &start_after,
        })
    } else {
        xml::list_bucket_result(&list)
    };
    Ok(xml_ok(body))
}

async fn stat_object(state: &AppState, path: &str) -> Result<EntryInfo, S3Error> {
    match state.cache.stat(path).await {
        Ok(entry) if !entry.is_dir => Ok(entry),
        _ => Err(S3Error::NotFound),
    }
}

fn if_none_match_hits(headers: &HeaderMap, etag: &str) -> bool {
    match headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value == "*" || value == etag,
        None => false,
    }
}

async fn head_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let path = fs::path_from_bucket_and_key(bucket, key);
    let entry = stat_object(state, &path).await?;
    let etag = generate_etag(&entry.path, entry.size, entry.last_modified);
    if if_none_match_hits(headers, &etag) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, entry.size)
        .header(header::LAST_MODIFIED, http_date(entry.last_modified))
        .header(header::ETAG, etag)
        .body(Body::empty())
        .map_err(|_| S3Error::InternalError)
}

async fn get_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let path = fs::path_from_bucket_and_key(bucket, key);
    let entry = stat_object(state, &path).await?;
    let etag = generate_etag(&entry.path, entry.size, entry.last_modified);
    if if_none_match_hits(headers, &etag) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .body(Body::empty())
            .map_err(|_| S3Error::InternalError);
    }

    // Cache said it exists; a missing backend object surfaces here as 404
    // and heals on the next sync.
    let stream = state.fs.read_stream(&path).await.map_err(|err| {
        tracing::warn!(path = %path, error = %err, "backend read failed");
        S3Error::NotFound
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, entry.size)
        .header(header::LAST_MODIFIED, http_date(entry.last_modified))
        .header(header::ETAG, etag)
        .body(Body::from_stream(stream))
        .map_err(|_| S3Error::InternalError)
}

async fn put_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let path = fs::path_from_bucket_and_key(bucket, key);
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let data: ByteStream = Box::pin(body.into_data_stream().map_err(io::Error::other));
    let expected_sha = headers
        .get("x-amz-content-sha256")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    let stream: ByteStream = match expected_sha {
        Some(expected) => Box::pin(Sha256Verifier::new(data, expected)),
        None => data,
    };

    state
        .fs
        .write_stream(&path, stream, content_length, 0o644)
        .await
        .map_err(|err| {
            if digest::is_digest_mismatch(&err) {
                return S3Error::BadDigest;
            }
            tracing::warn!(path = %path, error = %err, "backend write failed");
            S3Error::InternalError
        })?;

    // Trust the backend's view of what was written, then make the entry and
    // all missing ancestors visible in one transaction.
    let info = state.fs.stat(&path).await.map_err(|err| {
        tracing::warn!(path = %path, error = %err, "stat after upload failed");
        S3Error::InternalError
    })?;
    let entry = EntryInfo {
        path: path.clone(),
        size: info.size,
        last_modified: info.modified,
        is_dir: false,
        processed: true,
    };
    let mut batch = vec![entry.clone()];
    batch.extend(fs::base_dir_entries(&path, Utc::now().timestamp()));
    state.cache.insert(&batch).await.map_err(|err| {
        tracing::warn!(path = %path, error = %err, "cache insert after upload failed");
        S3Error::InternalError
    })?;

    let etag = generate_etag(&entry.path, entry.size, entry.last_modified);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, etag)
        .body(Body::empty())
        .map_err(|_| S3Error::InternalError)
}

/// Cache row first, then the backend object. A row left behind by a backend
/// failure would resurrect the object in listings; the inverse is healed by
/// the next sync.
async fn delete_object_inner(state: &AppState, path: &str) -> Result<(), S3Error> {
    state.cache.delete(path).await.map_err(|err| {
        tracing::warn!(path = %path, error = %err, "cache delete failed");
        S3Error::InternalError
    })?;
    match state.fs.remove(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "backend delete failed");
            Err(S3Error::InternalError)
        }
    }
}

async fn delete_object(state: &AppState, bucket: &str, key: &str) -> Result<Response, S3Error> {
    let path = fs::path_from_bucket_and_key(bucket, key);
    delete_object_inner(state, &path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn bulk_delete(state: &AppState, bucket: &str, body: Body) -> Result<Response, S3Error> {
    let bytes = axum::body::to_bytes(body, BULK_DELETE_BODY_LIMIT)
        .await
        .map_err(|_| S3Error::MalformedXML)?;
    let keys = xml::parse_delete_objects(&bytes).map_err(|_| S3Error::MalformedXML)?;

    let mut deleted = Vec::new();
    let mut errors = Vec::new();
    for key in keys {
        let path = fs::path_from_bucket_and_key(bucket, &key);
        match delete_object_inner(state, &path).await {
            Ok(()) => deleted.push(key),
            Err(err) => errors.push(DeleteError {
                key,
                code: err.code(),
                message: err.code().to_string(),
            }),
        }
    }
    Ok(xml_ok(xml::delete_result(&deleted, &errors)))
}

/// Static single-page browser. Redirects once to pin the access key and the
/// read-only flag into the query string the page's scripts read.
fn browser_page(state: &AppState, path: &str, raw_query: &str) -> Response {
    let mut query: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();
    let mut changed = false;
    if state.auth.enabled() && !query.iter().any(|(key, _)| key == "access_key") {
        query.push(("access_key".to_string(), state.auth.access_key.clone()));
        changed = true;
    }
    if state.read_only && !query.iter().any(|(key, _)| key == "read_only") {
        query.push(("read_only".to_string(), "true".to_string()));
        changed = true;
    }

    if changed {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &query {
            serializer.append_pair(key, value);
        }
        let location = format!("/{}?{}", path, serializer.finish());
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|_| s3_error(S3Error::InternalError));
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html")],
        BROWSER_HTML,
    )
        .into_response()
}
