use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Error {
    NoSuchBucket,
    NotFound,
    BadDigest,
    MalformedXML,
    MethodNotAllowed,
    InternalError,
}

impl S3Error {
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket => "NoSuchBucket",
            S3Error::NotFound => "NotFound",
            S3Error::BadDigest => "BadDigest",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::InternalError => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket => StatusCode::NOT_FOUND,
            S3Error::NotFound => StatusCode::NOT_FOUND,
            S3Error::BadDigest => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors go out as plain text carrying the S3 error code.
pub fn s3_error(error: S3Error) -> Response {
    (error.status(), error.code().to_string()).into_response()
}
