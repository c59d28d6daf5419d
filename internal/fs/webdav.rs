use crate::fs::{ByteStream, FileInfo, Fs, FsError};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::TryStreamExt;
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, StatusCode};
use std::io;
use url::Url;

const PROPFIND_BODY: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<D:propfind xmlns:D=\"DAV:\"><D:prop>",
    "<D:resourcetype/><D:getcontentlength/><D:getlastmodified/>",
    "</D:prop></D:propfind>"
);

/// Backend over a WebDAV server. Directory listings go through PROPFIND,
/// object bytes through plain GET/PUT.
pub struct WebDavFs {
    client: Client,
    base: Url,
    user: String,
    password: String,
}

impl WebDavFs {
    pub async fn connect(
        url: &str,
        user: &str,
        password: &str,
        insecure: bool,
    ) -> Result<Self, FsError> {
        let base = Url::parse(url).map_err(|err| FsError::Other(err.to_string()))?;
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        let fs = Self {
            client,
            base,
            user: user.to_string(),
            password: password.to_string(),
        };
        // Probe credentials and reachability before handing the client out.
        fs.propfind("", "0").await?;
        tracing::info!(url, "webdav: connected");
        Ok(fs)
    }

    fn url_for(&self, path: &str) -> Result<Url, FsError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| FsError::Other(format!("cannot-be-a-base url: {}", self.base)))?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|segment| !segment.is_empty()) {
                segments.push(segment);
            }
            if path.ends_with('/') {
                segments.push("");
            }
        }
        Ok(url)
    }

    async fn request(&self, method: Method, path: &str) -> Result<reqwest::Response, FsError> {
        let url = self.url_for(path)?;
        let response = self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Ok(response)
    }

    async fn propfind(&self, path: &str, depth: &str) -> Result<Vec<DavResponse>, FsError> {
        let method = Method::from_bytes(b"PROPFIND").expect("static method");
        let url = self.url_for(path)?;
        let response = self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(FsError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        parse_multistatus(&body)
    }

    async fn mkcol_ancestors(&self, path: &str) -> Result<(), FsError> {
        let method = Method::from_bytes(b"MKCOL").expect("static method");
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        if segments.len() < 2 {
            return Ok(());
        }
        let mut ancestor = String::new();
        for segment in &segments[..segments.len() - 1] {
            if !ancestor.is_empty() {
                ancestor.push('/');
            }
            ancestor.push_str(segment);
            let response = self.request(method.clone(), &ancestor).await?;
            let status = response.status();
            // 405 means the collection already exists.
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(FsError::Status {
                    path: ancestor.clone(),
                    status: status.as_u16(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fs for WebDavFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, FsError> {
        let responses = self.propfind(path, "1").await?;
        // The listed collection itself comes back as the first response;
        // compare against the full request path to drop it.
        let own = normalize_dav_path(self.url_for(path)?.path());
        let mut infos = Vec::new();
        for response in responses {
            let decoded = normalize_dav_path(&response.href);
            if decoded == own || decoded.is_empty() {
                continue;
            }
            let name = decoded
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            infos.push(FileInfo {
                name,
                size: if response.is_dir { 0 } else { response.size },
                modified: response.modified,
                is_dir: response.is_dir,
            });
        }
        Ok(infos)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let responses = self.propfind(path, "0").await?;
        let response = responses
            .into_iter()
            .next()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let decoded = decode_href(&response.href);
        let name = decoded
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(FileInfo {
            name,
            size: if response.is_dir { 0 } else { response.size },
            modified: response.modified,
            is_dir: response.is_dir,
        })
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, FsError> {
        let response = self.request(Method::GET, path).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(FsError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let stream = response
            .bytes_stream()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        Ok(Box::pin(stream))
    }

    async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        content_length: Option<u64>,
        _mode: u32,
    ) -> Result<(), FsError> {
        self.mkcol_ancestors(path).await?;
        let url = self.url_for(path)?;
        let mut request = self
            .client
            .put(url)
            .basic_auth(&self.user, Some(&self.password))
            .body(reqwest::Body::wrap_stream(stream));
        if let Some(length) = content_length {
            request = request.header("Content-Length", length);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FsError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        let response = self.request(Method::DELETE, path).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(FsError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DavResponse {
    href: String,
    is_dir: bool,
    size: i64,
    modified: i64,
}

fn decode_href(href: &str) -> String {
    percent_decode_str(href).decode_utf8_lossy().into_owned()
}

fn normalize_dav_path(path: &str) -> String {
    let decoded = decode_href(path);
    let trimmed = decoded.trim_matches('/');
    trimmed.to_string()
}

fn parse_multistatus(body: &[u8]) -> Result<Vec<DavResponse>, FsError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);
    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut field = Field::None;
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| FsError::Other(format!("propfind parse: {}", err)))?;
        match event {
            Event::Start(start) => match local_name(start.name().as_ref()) {
                b"response" => current = Some(DavResponse::default()),
                b"href" => field = Field::Href,
                b"getcontentlength" => field = Field::Size,
                b"getlastmodified" => field = Field::Modified,
                _ => {}
            },
            Event::Empty(empty) => {
                if local_name(empty.name().as_ref()) == b"collection" {
                    if let Some(response) = current.as_mut() {
                        response.is_dir = true;
                    }
                }
            }
            Event::Text(text) => {
                if let Some(response) = current.as_mut() {
                    let value = text
                        .unescape()
                        .map_err(|err| FsError::Other(format!("propfind parse: {}", err)))?;
                    apply_field(response, field, value.as_ref());
                }
                field = Field::None;
            }
            Event::End(end) => match local_name(end.name().as_ref()) {
                b"response" => {
                    if let Some(response) = current.take() {
                        responses.push(response);
                    }
                }
                b"collection" => {
                    if let Some(response) = current.as_mut() {
                        response.is_dir = true;
                    }
                }
                _ => field = Field::None,
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(responses)
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Href,
    Size,
    Modified,
}

fn apply_field(response: &mut DavResponse, field: Field, value: &str) {
    match field {
        Field::Href => response.href = value.to_string(),
        Field::Size => response.size = value.trim().parse().unwrap_or(0),
        Field::Modified => {
            response.modified = DateTime::parse_from_rfc2822(value.trim())
                .map(|parsed| parsed.timestamp())
                .unwrap_or(0);
        }
        Field::None => {}
    }
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|byte| *byte == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}
