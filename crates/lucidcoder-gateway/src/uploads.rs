use std::path::{Path, PathBuf};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use lucidcoder_registry::ProjectKey;

use crate::PreviewGateway;

/// Maps `/uploads/<file>` onto `<root>/uploads/<file>`, rejecting anything
/// that could escape the uploads directory.
pub fn upload_path(project_root: &Path, forward_path: &str) -> Option<PathBuf> {
    let path_only = forward_path.split(['?', '#']).next()?;
    let relative = path_only.strip_prefix("/uploads/")?;
    let decoded = urlencoding::decode(relative).ok()?;

    let mut path = project_root.join("uploads");
    let mut segments = 0;
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') || s.contains(':') => return None,
            s => {
                path.push(s);
                segments += 1;
            }
        }
    }
    (segments > 0).then_some(path)
}

/// Serves an uploaded file straight from disk. `None` means "not here, let
/// the dev server answer".
pub(crate) async fn serve_upload(
    gateway: &PreviewGateway,
    key: &ProjectKey,
    forward_path: &str,
) -> Option<Response> {
    let project = gateway.project(key).await?;
    let path = upload_path(Path::new(&project.path), forward_path)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            tracing::debug!(project_id = %key, path = %path.display(), "served upload from disk");
            Some(
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, mime.as_ref().to_string()),
                        (header::CACHE_CONTROL, "no-cache".to_string()),
                    ],
                    bytes,
                )
                    .into_response(),
            )
        }
        Err(err) => {
            tracing::trace!(project_id = %key, path = %path.display(), error = %err, "upload not on disk");
            None
        }
    }
}
