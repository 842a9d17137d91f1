//! Static file fallback for tenant routes
//!
//! Paths with no exact route resolve under the tenant's static root.
//! Resolution never escapes the root; anything that tries reads as not
//! found to the client, with the detail kept in the log.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::Response;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{json_error_response, HostErrorCode};

/// Map a URL path to a filesystem path under `root`
///
/// Returns None for traversal attempts. `.` segments are dropped, `..`
/// segments are refused rather than normalized. Backslash, colon, and
/// NUL segments are refused too: on Windows a segment like `C:` lexes
/// as a path prefix, and pushing a prefixed path replaces the
/// accumulated root instead of extending it.
pub fn resolve_path(root: &Path, url_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();

    for segment in url_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains(':') || s.contains('\0') => return None,
            s => resolved.push(s),
        }
    }

    Some(resolved)
}

/// Serve `url_path` from the tenant's static root
///
/// Directories resolve to their `index.html`. Missing files answer 404
/// without echoing the filesystem path back.
pub async fn serve_static(root: &Path, url_path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(mut resolved) = resolve_path(root, url_path) else {
        debug!(path = url_path, "rejected traversal in static path");
        return json_error_response(
            HostErrorCode::RouteNotFound,
            format!("no route for '{}'", url_path),
        );
    };

    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_dir() => resolved.push("index.html"),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return json_error_response(
                HostErrorCode::RouteNotFound,
                format!("no route for '{}'", url_path),
            );
        }
        Err(e) => {
            warn!(path = %resolved.display(), error = %e, "static metadata lookup failed");
            return json_error_response(HostErrorCode::InternalError, "static file error");
        }
    }

    match tokio::fs::read(&resolved).await {
        Ok(contents) => {
            let content_type = mime_guess::from_path(&resolved)
                .first_or_octet_stream()
                .to_string();
            Response::builder()
                .header("Content-Type", content_type)
                .body(
                    Full::new(Bytes::from(contents))
                        .map_err(|e| match e {})
                        .boxed(),
                )
                .expect("valid response with static headers")
        }
        Err(e) if e.kind() == ErrorKind::NotFound => json_error_response(
            HostErrorCode::RouteNotFound,
            format!("no route for '{}'", url_path),
        ),
        Err(e) => {
            warn!(path = %resolved.display(), error = %e, "static file read failed");
            json_error_response(HostErrorCode::InternalError, "static file error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    async fn body_text(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_resolve_path_joins_segments() {
        let root = Path::new("/srv/site");
        assert_eq!(
            resolve_path(root, "/css/main.css"),
            Some(PathBuf::from("/srv/site/css/main.css"))
        );
        assert_eq!(resolve_path(root, "/"), Some(PathBuf::from("/srv/site")));
        assert_eq!(
            resolve_path(root, "/a/./b"),
            Some(PathBuf::from("/srv/site/a/b"))
        );
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let root = Path::new("/srv/site");
        assert_eq!(resolve_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_path(root, "/a/../../b"), None);
        assert_eq!(resolve_path(root, "/a/..\\b"), None);
    }

    #[test]
    fn test_resolve_path_rejects_colon_segments() {
        let root = Path::new("/srv/site");
        // A drive prefix pushed onto the root would replace it on Windows
        assert_eq!(resolve_path(root, "/C:/secret"), None);
        assert_eq!(resolve_path(root, "/notes.txt:hidden"), None);
    }

    #[tokio::test]
    async fn test_serves_file_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), "<h1>hi</h1>").unwrap();

        let response = serve_static(dir.path(), "/page.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html"
        );
        assert_eq!(body_text(response).await, "<h1>hi</h1>");
    }

    #[tokio::test]
    async fn test_directory_resolves_to_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "front door").unwrap();

        let response = serve_static(dir.path(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "front door");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();

        let response = serve_static(dir.path(), "/nope.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Tenement-Error").unwrap(),
            "ROUTE_NOT_FOUND"
        );
        // The body names the URL path, never the filesystem path
        let body = body_text(response).await;
        assert!(body.contains("/nope.txt"));
        assert!(!body.contains(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_traversal_is_not_found() {
        let dir = tempfile::tempdir().unwrap();

        let response = serve_static(dir.path(), "/../secrets").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.weird"), [1u8, 2, 3]).unwrap();

        let response = serve_static(dir.path(), "/blob.weird").await;
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/octet-stream"
        );
    }
}
