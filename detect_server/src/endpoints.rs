//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart},
    response::Html,
    Extension, Json,
};
use bytes::Bytes;
use common::protocol::{DetectionResponse, FrameDims};

use crate::{error::DetectError, inferer::InferPool, meter::METER};

/// Name of the multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Viewer page streaming the device camera to the detection endpoint.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Frame size the detection boxes refer to, `null` if frames are processed as uploaded.
pub async fn frame_size(Extension(pool): Extension<Arc<InferPool>>) -> Json<Option<FrameDims>> {
    Json(pool.frame_size().map(|size| FrameDims {
        width: size.width,
        height: size.height,
    }))
}

/// Run object detection on an uploaded image.
pub async fn detect(
    Extension(pool): Extension<Arc<InferPool>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, DetectError> {
    METER.tick_request();

    let data = read_file_field(multipart?).await?;
    log::debug!("Received frame of {} bytes", data.len());

    let results = pool.detect(data).await?;
    METER.tick_detected();

    Ok(Json(DetectionResponse::new(results)))
}

/// Read the bytes of the first `file` field, skipping all other fields.
async fn read_file_field(mut multipart: Multipart) -> Result<Bytes, DetectError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }

    Err(DetectError::MissingFile)
}
