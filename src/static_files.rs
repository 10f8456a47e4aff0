//! Static file serving from the configured root
//!
//! Resolution returns `Option` so the `/api/` rule can fall through to the
//! upstream when no file matches. Paths with parent-directory segments are
//! rejected up front and the resolved file is canonicalized to keep every
//! response inside the root. File contents are streamed, not buffered.

use crate::error::{BodyError, ResponseBody};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Get the Content-Type based on file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|e| e.to_str());
    match extension {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("txt" | "md") => "text/plain; charset=utf-8",
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Resolve a request path to an existing file under the root.
///
/// Returns `None` when the file does not exist, is not a regular file (after
/// the `index.html` directory fallback), or escapes the root. Paths with a
/// `..` segment are rejected outright; dots inside a filename (`a..b.css`)
/// pass through untouched.
pub async fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    if relative.split('/').any(|segment| segment == "..") {
        warn!(path = request_path, "Rejected path with parent-directory segment");
        return None;
    }
    let candidate = root.join(relative);

    let root_canonical = match fs::canonicalize(root).await {
        Ok(p) => p,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Static root not accessible");
            return None;
        }
    };

    let mut resolved = fs::canonicalize(&candidate).await.ok()?;
    if !resolved.starts_with(&root_canonical) {
        warn!(
            path = request_path,
            resolved = %resolved.display(),
            "Rejected path escaping the static root"
        );
        return None;
    }

    let meta = fs::metadata(&resolved).await.ok()?;
    if meta.is_dir() {
        resolved = resolved.join("index.html");
        let is_file = fs::metadata(&resolved)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return None;
        }
    }

    Some(resolved)
}

/// Serve a request path from the root, or `None` when nothing matches.
/// The file is streamed in chunks with an explicit Content-Length.
pub async fn serve(root: &Path, request_path: &str) -> Option<Response<ResponseBody>> {
    let file_path = resolve(root, request_path).await?;
    let file = match fs::File::open(&file_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %file_path.display(), error = %e, "Failed to open static file");
            return None;
        }
    };
    let length = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!(path = %file_path.display(), error = %e, "Failed to stat static file");
            return None;
        }
    };

    debug!(path = %file_path.display(), bytes = length, "Serving static file");

    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_BYTES)
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BodyError);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(&file_path)),
        )
        .header(hyper::header::CONTENT_LENGTH, length)
        .body(StreamBody::new(stream).boxed())
        .expect("valid response builder");

    Some(response)
}
