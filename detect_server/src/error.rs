//! Errors of the detection endpoint and their HTTP representation.
//!
use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::DetectionResponse;
use thiserror::Error;

use crate::meter::METER;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid multipart request: {0}")]
    Multipart(String),
    #[error("upload too large: {0}")]
    TooLarge(String),
    #[error("no `file` field in upload")]
    MissingFile,
    #[error("uploaded file is empty")]
    EmptyUpload,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("model returned unknown class id {0}")]
    UnknownClass(usize),
    #[error("inference queue is full")]
    Busy,
    #[error("inference timed out")]
    Timeout,
    #[error("inference pool is shut down")]
    PoolClosed,
}

impl DetectError {
    pub fn status(&self) -> StatusCode {
        match self {
            DetectError::Multipart(_)
            | DetectError::MissingFile
            | DetectError::EmptyUpload
            | DetectError::Decode(_) => StatusCode::BAD_REQUEST,
            DetectError::Inference(_) | DetectError::UnknownClass(_) | DetectError::PoolClosed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DetectError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DetectError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<MultipartError> for DetectError {
    fn from(err: MultipartError) -> Self {
        // Bodies cut off by `DefaultBodyLimit` surface here while reading the fields
        match err.status() {
            StatusCode::PAYLOAD_TOO_LARGE => DetectError::TooLarge(err.body_text()),
            _ => DetectError::Multipart(err.body_text()),
        }
    }
}

impl From<MultipartRejection> for DetectError {
    fn from(rejection: MultipartRejection) -> Self {
        DetectError::Multipart(rejection.to_string())
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        METER.tick_failed();

        let status = self.status();
        let message = self.to_string();
        match status.is_server_error() {
            true => log::error!("Detection failed ({status}): {message}"),
            false => log::warn!("Detection rejected ({status}): {message}"),
        }

        (status, Json(DetectionResponse::failed(message))).into_response()
    }
}
