//! Error types and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

/// Error carried by response bodies: upstream stream failures or file reads
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type every handler returns
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Errors raised while loading the route file
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The route file could not be stat'ed or read
    #[error("route file {} unavailable: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The route file was read but could not be decoded
    #[error("route file {} is malformed: {reason}", path.display())]
    MalformedConfiguration { path: PathBuf, reason: String },
}

/// Error codes for responses the gateway produces itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No route matched the host, or the matched route has no backend
    UnknownHost,
    /// Request could not be forwarded to the upstream
    UpstreamUnreachable,
    /// No such file under a static root
    FileNotFound,
    /// File exists but the process may not read it
    Forbidden,
    /// A file under a static root could not be read
    StaticIoFailure,
    /// Request path was rejected by the static file server
    BadRequest,
    /// Static file server only answers GET and HEAD
    MethodNotAllowed,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::FileNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::StaticIoFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::StaticIoFailure => "STATIC_IO_FAILURE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }

    /// Fixed body sent with this error
    pub fn message(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "Not found.",
            ProxyErrorCode::UpstreamUnreachable => "Bad gateway.",
            ProxyErrorCode::FileNotFound => "404 page not found",
            ProxyErrorCode::Forbidden => "403 Forbidden",
            ProxyErrorCode::StaticIoFailure => "Internal server error.",
            ProxyErrorCode::BadRequest => "Bad request.",
            ProxyErrorCode::MethodNotAllowed => "Method not allowed.",
        }
    }
}

/// Build a plain-text error response with X-Proxy-Error header
pub fn error_response(code: ProxyErrorCode) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(hyper::header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header("X-Proxy-Error", code.as_header_value());

    if code == ProxyErrorCode::MethodNotAllowed {
        builder = builder.header(hyper::header::ALLOW, "GET, HEAD");
    }

    builder
        .body(full(format!("{}\n", code.message())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Wrap bytes into the boxed body type every handler returns
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::StaticIoFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_not_found_response() {
        let response = error_response(ProxyErrorCode::UnknownHost);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "UNKNOWN_HOST");
        assert!(response.headers().get("Allow").is_none());
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let response = error_response(ProxyErrorCode::MethodNotAllowed);
        assert_eq!(response.headers().get("Allow").unwrap(), "GET, HEAD");
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError::MalformedConfiguration {
            path: PathBuf::from("/etc/hostgate.json"),
            reason: "expected `[`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "route file /etc/hostgate.json is malformed: expected `[`"
        );
    }
}
