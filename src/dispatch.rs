//! Request dispatch: GET static files, POST JSON uploads, OPTIONS.
//!
//! Runs after the admission layer; every filesystem touch goes through
//! the path resolver first.

use crate::{
    config::ServerConfig,
    errors::Reject,
    http::{
        request::Request,
        response::Response,
        types::{Method, StatusCode},
    },
    observe,
    security::path::{self, PathDenied},
};
use chrono::{SecondsFormat, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use tokio::{fs, io::AsyncReadExt};

/// Files are read in slices of this size.
const READ_CHUNK_SIZE: usize = 8192;
/// Reading past this many bytes logs a warning; the read continues to
/// completion so `Content-Length` always matches the file.
const SOFT_READ_CAP: usize = 10 * 1024 * 1024;

pub(crate) const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";

/// Applies the method matrix. `client` is the peer address, used for
/// security events.
pub async fn dispatch(
    request: &Request,
    config: &ServerConfig,
    client: &str,
) -> Result<Response, Reject> {
    match request.method {
        Method::Get => handle_get(request, config, client).await,
        Method::Post => handle_post(request, config).await,
        Method::Options => Ok(Response::new(StatusCode::NoContent).header("Allow", ALLOWED_METHODS)),
        Method::Other => Err(Reject::MethodNotAllowed),
    }
}

async fn handle_get(
    request: &Request,
    config: &ServerConfig,
    client: &str,
) -> Result<Response, Reject> {
    let request_path = match request.path.as_str() {
        "/" => "index.html",
        p => p,
    };

    let file_path = path::resolve(request_path, &config.resource_root).map_err(|denied| {
        observe::security_violation(client, &request.request_line, &denied.to_string());
        Reject::Forbidden(denied_label(denied))
    })?;

    let meta = fs::metadata(&file_path)
        .await
        .map_err(|_| Reject::NotFound)?;
    if !meta.is_file() {
        return Err(Reject::NotFound);
    }

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (content_type, attachment) = content_type_for(&file_name)?;

    let mut file = fs::File::open(&file_path).await.map_err(|e| {
        tracing::error!(error = %e, file = %file_name, "failed to open resource");
        Reject::Internal
    })?;

    let mut data = Vec::with_capacity(meta.len().min(SOFT_READ_CAP as u64) as usize);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut warned = false;
    loop {
        let n = file.read(&mut chunk).await.map_err(|e| {
            tracing::error!(error = %e, file = %file_name, "file read failed");
            Reject::Internal
        })?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
        if !warned && data.len() > SOFT_READ_CAP {
            tracing::warn!(
                file = %file_name,
                size = meta.len(),
                "serving file past the soft read cap"
            );
            warned = true;
        }
    }

    let mut response = Response::new(StatusCode::Ok).header("Content-Type", content_type);
    if attachment {
        response = response.header(
            "Content-Disposition",
            format!("attachment; filename=\"{file_name}\""),
        );
    }
    Ok(response.with_body(data))
}

fn denied_label(denied: PathDenied) -> &'static str {
    match denied {
        PathDenied::Traversal => "path traversal detected",
        PathDenied::AbsolutePath => "absolute path not allowed",
        PathDenied::Escape => "path escapes resource root",
    }
}

/// Extension to `(Content-Type, attachment?)`; unknown extensions are
/// not served.
fn content_type_for(file_name: &str) -> Result<(&'static str, bool), Reject> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" => Ok(("text/html; charset=utf-8", false)),
        "json" => Ok(("application/json; charset=utf-8", false)),
        "png" | "jpg" | "jpeg" | "gif" | "txt" => Ok(("application/octet-stream", true)),
        "pdf" => Ok(("application/pdf", false)),
        _ => Err(Reject::UnsupportedMediaType("unsupported file type")),
    }
}

#[derive(Serialize)]
struct UploadReceipt {
    status: &'static str,
    filepath: String,
    size: usize,
    received_at: String,
}

async fn handle_post(request: &Request, config: &ServerConfig) -> Result<Response, Reject> {
    if request.path.trim_end_matches('/') != "/upload" {
        return Err(Reject::NotFound);
    }

    let media_type = request
        .headers
        .get("content-type")
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if media_type != "application/json" {
        return Err(Reject::UnsupportedMediaType("only application/json accepted"));
    }

    let document: serde_json::Value =
        serde_json::from_slice(&request.body).map_err(|_| Reject::InvalidJson)?;
    let normalized = serde_json::to_vec(&document).map_err(|_| Reject::Internal)?;

    let now = Utc::now();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let file_name = format!("upload_{}_{}.json", now.format("%Y%m%dT%H%M%SZ"), suffix);

    // Temp-file-plus-rename keeps partially-written uploads from ever
    // being visible under their advertised name.
    let uploads = config.uploads_dir();
    let tmp_path = uploads.join(format!(".{file_name}.tmp"));
    let final_path = uploads.join(&file_name);

    fs::write(&tmp_path, &normalized).await.map_err(|e| {
        tracing::error!(error = %e, "upload write failed");
        Reject::Internal
    })?;
    fs::rename(&tmp_path, &final_path).await.map_err(|e| {
        tracing::error!(error = %e, "upload rename failed");
        Reject::Internal
    })?;

    let receipt = UploadReceipt {
        status: "created",
        filepath: format!("/uploads/{file_name}"),
        size: normalized.len(),
        received_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let body = serde_json::to_vec(&receipt).map_err(|_| Reject::Internal)?;

    Ok(Response::new(StatusCode::Created)
        .header("Content-Type", "application/json; charset=utf-8")
        .with_body(body))
}
