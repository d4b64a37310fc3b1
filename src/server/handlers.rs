//! Request handlers

use super::error::ApiError;
use super::AppState;
use crate::backends::{DecompositionBackend, DecompositionRequest, DEFAULT_NUM_LAYERS};
use crate::config::SERVICE_NAME;
use crate::error::{LayerFlowError, Result};
use crate::services::ImageCodec;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::time::Instant;
use tracing::Instrument;

const INVALID_FILE_TYPE: &str =
    "Invalid file type. Only image files (PNG, JPEG, WebP, GIF, AVIF) are supported.";

/// Filename assumed when the upload carries none
const FALLBACK_FILENAME: &str = "image.png";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DecomposeResponse {
    pub layers: Vec<String>,
    pub count: usize,
}

/// The `image` part of the form
#[derive(Debug)]
pub(crate) struct Upload {
    pub(crate) bytes: Vec<u8>,
    pub(crate) filename: Option<String>,
    /// Lowercased declared content type, empty when absent
    pub(crate) content_type: String,
}

impl Upload {
    /// Declared `image/*` type without parameters, or one inferred from the filename
    pub(crate) fn media_type(&self) -> String {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        if essence.len() > "image/".len() && essence.starts_with("image/") {
            return essence.to_string();
        }
        let filename = self.filename.as_deref().unwrap_or(FALLBACK_FILENAME);
        ImageCodec::media_type_from_filename(filename).to_string()
    }
}

/// Reject declared content types that are not images; an absent type passes
pub(crate) fn validate_content_type(content_type: &str) -> Result<()> {
    if !content_type.is_empty() && !content_type.starts_with("image/") {
        return Err(LayerFlowError::validation(INVALID_FILE_TYPE));
    }
    Ok(())
}

pub(crate) fn parse_num_layers(raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(LayerFlowError::invalid_request(format!(
            "num_layers must be a positive integer, got '{}'",
            raw.trim()
        ))),
    }
}

async fn read_form(mut multipart: Multipart) -> std::result::Result<(Upload, u32), ApiError> {
    let mut upload = None;
    let mut num_layers = DEFAULT_NUM_LAYERS;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(&e))?
    {
        match field.name() {
            Some("image") => {
                let content_type = field
                    .content_type()
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_default();
                validate_content_type(&content_type)?;

                let filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::from_multipart(&e))?;

                upload = Some(Upload {
                    bytes: bytes.to_vec(),
                    filename,
                    content_type,
                });
            },
            Some("num_layers") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::from_multipart(&e))?;
                num_layers = parse_num_layers(&raw)?;
            },
            other => log::debug!("Ignoring form field {other:?}"),
        }
    }

    let upload =
        upload.ok_or_else(|| LayerFlowError::invalid_request("missing form field 'image'"))?;
    Ok((upload, num_layers))
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        mode: state.config().mode_label(),
    })
}

pub(crate) async fn decompose(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> std::result::Result<Json<DecomposeResponse>, ApiError> {
    let (upload, num_layers) = read_form(multipart?).await?;

    let backend = state.backend();
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "decompose",
        request_id = %request_id,
        backend = %backend.kind(),
        filename = upload.filename.as_deref().unwrap_or(FALLBACK_FILENAME),
        num_layers = num_layers,
    );

    let start = Instant::now();
    let layers = run_decomposition(backend.as_ref(), upload, num_layers)
        .instrument(span.clone())
        .await
        .map_err(|e| span.in_scope(|| ApiError::from(e)))?;

    span.in_scope(|| {
        tracing::info!(
            count = layers.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Decomposition finished"
        );
    });
    Ok(Json(DecomposeResponse {
        count: layers.len(),
        layers,
    }))
}

async fn run_decomposition(
    backend: &dyn DecompositionBackend,
    upload: Upload,
    num_layers: u32,
) -> Result<Vec<String>> {
    let media_type = upload.media_type();
    tracing::info!(
        bytes = upload.bytes.len(),
        media_type = %media_type,
        "Decomposition started"
    );

    let request = DecompositionRequest::new(upload.bytes, media_type, num_layers);
    let layers = backend.decompose(request).await?;
    if layers.is_empty() {
        return Err(LayerFlowError::NoLayers);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(filename: Option<&str>, content_type: &str) -> Upload {
        Upload {
            bytes: vec![],
            filename: filename.map(str::to_string),
            content_type: content_type.to_string(),
        }
    }

    #[test]
    fn test_content_type_validation() {
        assert!(validate_content_type("image/png").is_ok());
        assert!(validate_content_type("image/avif").is_ok());
        assert!(validate_content_type("").is_ok());

        let err = validate_content_type("text/plain").unwrap_err();
        assert!(matches!(err, LayerFlowError::Validation(_)));
        assert_eq!(err.client_message(), INVALID_FILE_TYPE);
        assert!(validate_content_type("application/octet-stream").is_err());
    }

    #[test]
    fn test_media_type_prefers_declared_type() {
        assert_eq!(upload(Some("photo.png"), "image/jpeg").media_type(), "image/jpeg");
        assert_eq!(upload(Some("photo.webp"), "").media_type(), "image/webp");
        assert_eq!(upload(None, "").media_type(), "image/png");
        assert_eq!(upload(Some("scan.tiff"), "").media_type(), "image/png");
    }

    #[test]
    fn test_media_type_drops_parameters() {
        assert_eq!(
            upload(Some("photo.png"), "image/png; charset=x").media_type(),
            "image/png"
        );
        assert_eq!(upload(Some("photo.gif"), "image/jpeg;q=1").media_type(), "image/jpeg");
        assert_eq!(upload(Some("photo.gif"), "image/; x=1").media_type(), "image/gif");
    }

    #[test]
    fn test_parse_num_layers() {
        assert_eq!(parse_num_layers("3").unwrap(), 3);
        assert_eq!(parse_num_layers(" 8 ").unwrap(), 8);

        for raw in ["0", "-1", "abc", "", "2.5"] {
            let err = parse_num_layers(raw).unwrap_err();
            assert_eq!(err.status_code(), 422, "input {raw:?}");
        }
    }
}
