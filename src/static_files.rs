//! Static directory backend
//!
//! Maps the request path onto a root directory:
//! - `..` segments, backslashes and NUL bytes are rejected outright
//! - anything that canonicalizes outside the root (symlinks) is a 404
//! - directories need a trailing slash and serve `index.html` if present,
//!   otherwise a plain listing
//! - `Last-Modified` / `If-Modified-Since` at one-second resolution
//! - file bodies are streamed from disk, never buffered whole

use crate::error::{error_response, full, BoxError, ProxyBody, ProxyErrorCode};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, Response, StatusCode};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

const INDEX_FILE: &str = "index.html";

type StaticResponse = Response<ProxyBody>;

/// Serve `req` from the directory `root`
pub async fn serve<B>(req: &Request<B>, root: &Path) -> StaticResponse {
    let method = req.method();
    if method != Method::GET && method != Method::HEAD {
        return error_response(ProxyErrorCode::MethodNotAllowed);
    }

    let raw_path = req.uri().path();
    let decoded = match urlencoding::decode(raw_path) {
        Ok(p) => p,
        Err(_) => return error_response(ProxyErrorCode::BadRequest),
    };

    let path = match resolve_path(root, &decoded) {
        Some(p) => p,
        None => {
            warn!(root = %root.display(), path = %raw_path, "Rejected static path");
            return error_response(ProxyErrorCode::BadRequest);
        }
    };

    let query = req.uri().query();

    // `/dir/index.html` is only ever served as `/dir/`
    if let Some(dir_path) = raw_path.strip_suffix(INDEX_FILE) {
        if dir_path.ends_with('/') {
            return redirect(dir_path, query);
        }
    }

    if !within_root(root, &path).await {
        warn!(root = %root.display(), path = %path.display(), "Static path escapes root");
        return error_response(ProxyErrorCode::FileNotFound);
    }

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) => return io_error_response(&path, e),
    };

    if metadata.is_dir() {
        if !raw_path.ends_with('/') {
            return redirect(&format!("{}/", raw_path), query);
        }

        let index = path.join(INDEX_FILE);
        match tokio::fs::metadata(&index).await {
            Ok(index_meta) if index_meta.is_file() => {
                return serve_file(req, &index, &index_meta).await;
            }
            _ => return list_directory(req, &path, &decoded).await,
        }
    }

    if raw_path.ends_with('/') {
        return redirect(raw_path.trim_end_matches('/'), query);
    }

    serve_file(req, &path, &metadata).await
}

/// Join the decoded request path onto `root`, refusing anything that could
/// climb out of it.
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.contains('\0') || request_path.contains('\\') {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => resolved.push(s),
        }
    }

    Some(resolved)
}

/// Check that symlinks under the root do not lead outside of it.
///
/// Paths that do not exist pass; the following metadata lookup reports them.
async fn within_root(root: &Path, path: &Path) -> bool {
    let canonical_root = match tokio::fs::canonicalize(root).await {
        Ok(p) => p,
        Err(_) => return true,
    };

    match tokio::fs::canonicalize(path).await {
        Ok(canonical) => canonical.starts_with(&canonical_root),
        Err(_) => true,
    }
}

async fn serve_file<B>(req: &Request<B>, path: &Path, metadata: &Metadata) -> StaticResponse {
    let modified = metadata.modified().ok();
    let last_modified = modified.map(http_date);

    if let Some(modified) = modified {
        if not_modified(req.headers(), modified) {
            let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
            if let Some(ref lm) = last_modified {
                builder = builder.header(header::LAST_MODIFIED, lm.as_str());
            }
            return builder
                .body(full(Bytes::new()))
                .expect("valid response builder");
        }
    }

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let length = metadata.len();

    let body = if req.method() == Method::HEAD {
        full(Bytes::new())
    } else {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => return io_error_response(path, e),
        };
        let stream = ReaderStream::new(file)
            .map_ok(Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });
        StreamBody::new(stream).boxed()
    };

    debug!(path = %path.display(), bytes = length, "Serving static file");

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, length);
    if let Some(lm) = last_modified {
        builder = builder.header(header::LAST_MODIFIED, lm);
    }

    builder.body(body).expect("valid response builder")
}

async fn list_directory<B>(req: &Request<B>, dir: &Path, display_path: &str) -> StaticResponse {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(r) => r,
        Err(e) => return io_error_response(dir, e),
    };

    let mut names = Vec::new();
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
            Ok(None) => break,
            Err(e) => return io_error_response(dir, e),
        }
    }
    names.sort();

    let mut html = format!(
        "<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n<title>{}</title>\n<pre>\n",
        escape_html(display_path)
    );
    for name in &names {
        let href = match name.strip_suffix('/') {
            Some(dir_name) => format!("{}/", urlencoding::encode(dir_name)),
            None => urlencoding::encode(name).into_owned(),
        };
        html.push_str(&format!("<a href=\"{}\">{}</a>\n", href, escape_html(name)));
    }
    html.push_str("</pre>\n");

    let length = html.len();
    let body = if req.method() == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(html)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CONTENT_LENGTH, length)
        .body(full(body))
        .expect("valid response builder")
}

fn redirect(location: &str, query: Option<&str>) -> StaticResponse {
    let location = match query {
        Some(q) => format!("{}?{}", location, q),
        None => location.to_string(),
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(full(Bytes::new()))
        .expect("valid response builder")
}

fn io_error_response(path: &Path, e: std::io::Error) -> StaticResponse {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::NotADirectory => {
            error_response(ProxyErrorCode::FileNotFound)
        }
        ErrorKind::PermissionDenied => error_response(ProxyErrorCode::Forbidden),
        _ => {
            error!(path = %path.display(), error = %e, "Failed to read static file");
            error_response(ProxyErrorCode::StaticIoFailure)
        }
    }
}

/// Format a timestamp as an HTTP date (RFC 7231 IMF-fixdate)
pub fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// True if `If-Modified-Since` is at or after `modified` (second resolution)
fn not_modified(headers: &HeaderMap, modified: SystemTime) -> bool {
    let since = match headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    {
        Some(t) => t.timestamp(),
        None => return false,
    };

    let modified_secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => return false,
    };

    modified_secs <= since
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    async fn body_string(response: StaticResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        std::fs::write(dir.path().join("style.css"), "body {}").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("a&b.txt"), "x").unwrap();
        dir
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_path(root, "/"), Some(PathBuf::from("/srv/www")));
        assert_eq!(
            resolve_path(root, "/a/./b.txt"),
            Some(PathBuf::from("/srv/www/a/b.txt"))
        );
        assert_eq!(resolve_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_path(root, "/a/../../etc/passwd"), None);
        assert_eq!(resolve_path(root, "/a\\..\\b"), None);
        assert_eq!(resolve_path(root, "/a\0b"), None);
    }

    #[tokio::test]
    async fn test_serves_file_with_mime_type() {
        let dir = site();
        let response = serve(&request(Method::GET, "/style.css"), dir.path()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/css");
        assert_eq!(response.headers().get("content-length").unwrap(), "7");
        assert!(response.headers().get("last-modified").is_some());
        assert_eq!(body_string(response).await, "body {}");
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let dir = site();
        let response = serve(&request(Method::HEAD, "/hello.txt"), dir.path()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-length").unwrap(), "11");
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_large_file_arrives_in_chunks() {
        let dir = site();
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("blob.bin"), &content).unwrap();

        let response = serve(&request(Method::GET, "/blob.bin"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-length").unwrap(), "100000");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );

        let mut body = response.into_body();
        let mut frames = 0;
        let mut received = Vec::new();
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            received.extend_from_slice(&data);
            frames += 1;
        }
        assert!(frames > 1);
        assert_eq!(received, content);
    }

    #[tokio::test]
    async fn test_percent_encoded_path() {
        let dir = site();
        let response = serve(&request(Method::GET, "/assets/a%26b.txt"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let dir = site();

        let response = serve(&request(Method::GET, "/../hello.txt"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = serve(&request(Method::GET, "/docs/%2e%2e/%2e%2e/etc/passwd"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_not_served() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let dir = site();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
            .unwrap();

        let response = serve(&request(Method::GET, "/link.txt"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = site();
        let response = serve(&request(Method::GET, "/nope.txt"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = serve(&request(Method::GET, "/hello.txt/more"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_directory_redirects_and_index() {
        let dir = site();

        let response = serve(&request(Method::GET, "/docs?v=1"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("location").unwrap(), "/docs/?v=1");

        let response = serve(&request(Method::GET, "/docs/"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "<h1>docs</h1>");

        let response = serve(&request(Method::GET, "/docs/index.html"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("location").unwrap(), "/docs/");

        let response = serve(&request(Method::GET, "/hello.txt/"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("location").unwrap(), "/hello.txt");
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let dir = site();
        let response = serve(&request(Method::GET, "/"), dir.path()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        let html = body_string(response).await;
        assert!(html.contains("<a href=\"hello.txt\">hello.txt</a>"));
        assert!(html.contains("<a href=\"docs/\">docs/</a>"));

        let response = serve(&request(Method::GET, "/assets/"), dir.path()).await;
        let html = body_string(response).await;
        assert!(html.contains("<a href=\"a%26b.txt\">a&amp;b.txt</a>"));
    }

    #[tokio::test]
    async fn test_if_modified_since() {
        let dir = site();
        let modified = std::fs::metadata(dir.path().join("hello.txt"))
            .unwrap()
            .modified()
            .unwrap();

        let req = Request::builder()
            .uri("/hello.txt")
            .header("if-modified-since", http_date(modified))
            .body(())
            .unwrap();
        let response = serve(&req, dir.path()).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let req = Request::builder()
            .uri("/hello.txt")
            .header("if-modified-since", http_date(modified - Duration::from_secs(3600)))
            .body(())
            .unwrap();
        let response = serve(&req, dir.path()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let dir = site();
        let response = serve(&request(Method::POST, "/hello.txt"), dir.path()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("allow").unwrap(), "GET, HEAD");
    }

    #[test]
    fn test_http_date() {
        let time = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
