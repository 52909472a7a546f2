//! HTTP handlers for image upload and retrieval.
//! Upload bodies are streamed to the staging area rather than buffered, and
//! stored images are streamed back from disk.

use crate::{
    errors::AppError,
    models::{
        image::ImageKind,
        upload::{DataUrlUpload, Label, UploadResponse, labels_from_file_name},
    },
    services::{
        public_url::{base_url, image_link},
        storage_service::{NamingPlan, StagedFile},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{
        FromRequest, Multipart, Path, Request, State, multipart::MultipartError,
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use serde_json::json;
use std::convert::Infallible;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Cache policy for served images.
pub const IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";

/// An upload body staged on disk plus everything needed to name it.
struct IncomingUpload {
    staged: StagedFile,
    kind: ImageKind,
    file_name: Option<String>,
    registro: Option<String>,
    ponto: Option<String>,
}

/// `POST /upload`
///
/// Accepts either `multipart/form-data` (a file part plus optional
/// `registro`/`ponto` text parts) or a JSON body carrying a base64 data URL.
pub async fn upload_image(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<UploadResponse>, AppError> {
    let headers = request.headers().clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let upload = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|rejection| AppError::new(rejection.status(), rejection.body_text()))?;
        read_multipart(&state, multipart).await?
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<DataUrlUpload>::from_request(request, &state)
            .await
            .map_err(json_error)?;
        read_data_url(&state, body).await?
    } else {
        return Err(AppError::unsupported_media(
            "expected multipart/form-data or application/json",
        ));
    };

    let IncomingUpload {
        staged,
        kind,
        file_name,
        mut registro,
        mut ponto,
    } = upload;

    if let Some((file_registro, file_ponto)) = file_name.as_deref().and_then(labels_from_file_name)
    {
        registro.get_or_insert(file_registro);
        ponto.get_or_insert(file_ponto);
    }

    let plan = NamingPlan::new(registro.as_deref(), ponto.as_deref(), kind)?;
    let image = state.storage.commit(staged, &plan).await?;

    let path = image.relative_path();
    let link = image_link(&base_url(&state.config, &headers), &path);
    info!(path = %path, size = image.size_bytes, link = %link, "stored upload");

    Ok(Json(UploadResponse {
        link,
        path,
        filename: image.file_name,
        registro,
        ponto,
        mime: kind.mime().to_string(),
        size: image.size_bytes,
        etag: image.etag,
    }))
}

/// Well-formed JSON with a field of the wrong shape (e.g. a negative
/// `registro`) is a client error like any other invalid field.
fn json_error(rejection: JsonRejection) -> AppError {
    match rejection {
        JsonRejection::JsonDataError(err) => AppError::bad_request(err.body_text()),
        other => AppError::new(other.status(), other.body_text()),
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// Walk the multipart fields, staging the first file part as it streams in.
async fn read_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<IncomingUpload, AppError> {
    let limit = state.config.max_size_bytes();
    let mut registro = None;
    let mut ponto = None;
    let mut file: Option<(StagedFile, ImageKind, Option<String>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "registro" => {
                registro = Label::Text(field.text().await.map_err(multipart_error)?).into_text();
            }
            "ponto" => {
                ponto = Label::Text(field.text().await.map_err(multipart_error)?).into_text();
            }
            _ if file.is_none() && (name == "file" || field.file_name().is_some()) => {
                let file_name = field.file_name().map(base_name);
                let declared = field.content_type().map(str::to_string);
                let kind = ImageKind::detect(declared.as_deref(), file_name.as_deref())
                    .ok_or_else(|| {
                        AppError::unsupported_media(format!(
                            "unsupported image type `{}`",
                            declared.as_deref().unwrap_or("unknown")
                        ))
                    })?;
                let staged = state.storage.stage(field, limit).await?;
                file = Some((staged, kind, file_name));
            }
            _ => debug!("ignoring multipart field `{}`", name),
        }
    }

    let (staged, kind, file_name) =
        file.ok_or_else(|| AppError::bad_request("missing file part"))?;
    Ok(IncomingUpload {
        staged,
        kind,
        file_name,
        registro,
        ponto,
    })
}

/// Decode a `data:<mime>;base64,<payload>` upload and stage it.
async fn read_data_url(state: &AppState, body: DataUrlUpload) -> Result<IncomingUpload, AppError> {
    if body.filename.trim().is_empty() || body.data_url.is_empty() {
        return Err(AppError::bad_request("filename and data_url are required"));
    }

    let (mime, payload) =
        parse_data_url(&body.data_url).ok_or_else(|| AppError::bad_request("invalid data_url"))?;
    let kind = ImageKind::from_mime(mime)
        .ok_or_else(|| AppError::unsupported_media(format!("MIME type not allowed: {}", mime)))?;
    let binary = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|_| AppError::bad_request("invalid base64 payload"))?;

    let chunk = stream::once(async move { Ok::<_, Infallible>(Bytes::from(binary)) });
    let staged = state
        .storage
        .stage(chunk, state.config.max_size_bytes())
        .await?;

    Ok(IncomingUpload {
        staged,
        kind,
        file_name: Some(base_name(&body.filename)),
        registro: body.registro.and_then(Label::into_text),
        ponto: body.ponto.and_then(Label::into_text),
    })
}

/// Split a data URL into its MIME type and base64 payload.
fn parse_data_url(data_url: &str) -> Option<(&str, &str)> {
    let rest = data_url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    let valid_mime = !mime.is_empty()
        && mime
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '.' | '+' | '_'));
    (valid_mime && !payload.is_empty()).then_some((mime, payload))
}

/// Last component of a client-supplied file name, whichever separator it uses.
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).trim().to_string()
}

/// `GET /imagens/{*path}`: stream a stored image.
pub async fn get_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (file, metadata) = state.storage.open(&path).await?;
    let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);
    let etag = file_etag(metadata.len(), modified);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidates| candidates.split(',').any(|c| c.trim() == etag));

    let mut response = if not_modified {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
    } else {
        let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
        let content_type = ImageKind::from_file_name(&path)
            .map(ImageKind::mime)
            .unwrap_or("application/octet-stream");
        let resp_headers = response.headers_mut();
        resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
        response
    };

    let resp_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        resp_headers.insert(header::ETAG, value);
    }
    if let Some(value) = modified.and_then(|m| HeaderValue::from_str(&http_date(m)).ok()) {
        resp_headers.insert(header::LAST_MODIFIED, value);
    }
    resp_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(IMAGE_CACHE_CONTROL),
    );

    Ok(response)
}

/// Weak validator derived from modification time and size.
fn file_etag(size: u64, modified: Option<DateTime<Utc>>) -> String {
    let stamp = modified.map(|m| m.timestamp_millis()).unwrap_or_default();
    format!("\"{:x}\"", md5::compute(format!("{}-{}", stamp, size)))
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `GET /`: routing diagnostics for deployments.
pub async fn service_info(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let cfg = &state.config;
    Json(json!({
        "service": "upload-service",
        "version": env!("CARGO_PKG_VERSION"),
        "base_url": base_url(cfg, &headers),
        "cors_origins": cfg.cors_origins,
        "max_size_mb": cfg.max_size_mb,
        "allowed_mimes": ImageKind::ALL.iter().map(|k| k.mime()).collect::<Vec<_>>(),
        "images_root": cfg.images_root.display().to_string(),
        "environment": cfg.environment.to_string(),
    }))
}
