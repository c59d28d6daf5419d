use chrono::{TimeZone, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn s3_timestamp(unix_seconds: i64) -> String {
    Utc.timestamp_opt(unix_seconds, 0)
        .single()
        .unwrap_or_default()
        .to_rfc3339()
}

/// One `<Contents>` entry of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectItem {
    pub key: String,
    pub last_modified: i64,
    pub etag: String,
    pub size: i64,
}

pub fn list_buckets(buckets: &[String], created_at: i64) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<ListAllMyBucketsResult><Buckets>");
    for bucket in buckets {
        body.push_str("<Bucket><Name>");
        body.push_str(&xml_escape(bucket));
        body.push_str("</Name><CreationDate>");
        body.push_str(&s3_timestamp(created_at));
        body.push_str("</CreationDate></Bucket>");
    }
    body.push_str("</Buckets></ListAllMyBucketsResult>");
    body
}

pub struct ListArgs<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub marker: &'a str,
    pub delimiter: &'a str,
    pub max_keys: i64,
    pub is_truncated: bool,
    pub next_marker: &'a str,
    pub contents: &'a [ObjectItem],
    pub common_prefixes: &'a [String],
}

pub fn list_bucket_result(args: &ListArgs<'_>) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<ListBucketResult>");
    append_list_header(&mut body, args);
    if !args.marker.is_empty() {
        append_element(&mut body, "Marker", args.marker);
    }
    if args.is_truncated && !args.next_marker.is_empty() {
        append_element(&mut body, "NextMarker", args.next_marker);
    }
    append_contents(&mut body, args);
    body.push_str("</ListBucketResult>");
    body
}

pub struct ListV2Args<'a> {
    pub list: ListArgs<'a>,
    pub continuation_token: &'a str,
    pub start_after: &'a str,
}

pub fn list_bucket_result_v2(args: &ListV2Args<'_>) -> String {
    let list = &args.list;
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<ListBucketResult>");
    append_list_header(&mut body, list);
    let key_count = list.contents.len() + list.common_prefixes.len();
    append_element(&mut body, "KeyCount", &key_count.to_string());
    if !args.continuation_token.is_empty() {
        append_element(&mut body, "ContinuationToken", args.continuation_token);
    }
    if list.is_truncated && !list.next_marker.is_empty() {
        append_element(&mut body, "NextContinuationToken", list.next_marker);
    }
    if !args.start_after.is_empty() {
        append_element(&mut body, "StartAfter", args.start_after);
    }
    append_contents(&mut body, list);
    body.push_str("</ListBucketResult>");
    body
}

fn append_list_header(body: &mut String, args: &ListArgs<'_>) {
    append_element(body, "Name", args.bucket);
    append_element(body, "Prefix", args.prefix);
    append_element(body, "MaxKeys", &args.max_keys.to_string());
    if !args.delimiter.is_empty() {
        append_element(body, "Delimiter", args.delimiter);
    }
    append_element(
        body,
        "IsTruncated",
        if args.is_truncated { "true" } else { "false" },
    );
}

fn append_contents(body: &mut String, args: &ListArgs<'_>) {
    for item in args.contents {
        body.push_str("<Contents>");
        append_element(body, "Key", &item.key);
        append_element(body, "LastModified", &s3_timestamp(item.last_modified));
        append_element(body, "ETag", &item.etag);
        append_element(body, "Size", &item.size.to_string());
        append_element(body, "StorageClass", "STANDARD");
        body.push_str("</Contents>");
    }
    for prefix in args.common_prefixes {
        body.push_str("<CommonPrefixes>");
        append_element(body, "Prefix", prefix);
        body.push_str("</CommonPrefixes>");
    }
}

fn append_element(body: &mut String, name: &str, value: &str) {
    body.push('<');
    body.push_str(name);
    body.push('>');
    body.push_str(&xml_escape(value));
    body.push_str("</");
    body.push_str(name);
    body.push('>');
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(rename = "Object", default)]
    objects: Vec<DeleteObject>,
}

#[derive(Debug, Deserialize)]
struct DeleteObject {
    #[serde(rename = "Key")]
    key: String,
}

/// Keys from a bulk-delete `<Delete>` document, in request order.
pub fn parse_delete_objects(body: &[u8]) -> Result<Vec<String>, quick_xml::de::DeError> {
    let text = String::from_utf8_lossy(body);
    let request: DeleteRequest = from_str(&text)?;
    Ok(request.objects.into_iter().map(|object| object.key).collect())
}

/// One failed key of a bulk delete.
pub struct DeleteError {
    pub key: String,
    pub code: &'static str,
    pub message: String,
}

pub fn delete_result(deleted: &[String], errors: &[DeleteError]) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<DeleteResult>");
    for key in deleted {
        body.push_str("<Deleted>");
        append_element(&mut body, "Key", key);
        body.push_str("</Deleted>");
    }
    for error in errors {
        body.push_str("<Error>");
        append_element(&mut body, "Key", &error.key);
        append_element(&mut body, "Code", error.code);
        append_element(&mut body, "Message", &error.message);
        body.push_str("</Error>");
    }
    body.push_str("</DeleteResult>");
    body
}
