use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::CorsLayer;

use crate::{
    endpoints::{detect, frame_size, healthcheck, index},
    inferer::InferPool,
};

/// Build the HTTP router with the inference pool injected into the handlers.
pub fn build_router(pool: Arc<InferPool>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/frame_size", get(frame_size))
        .route("/detect/", post(detect))
        .route("/detect", post(detect))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(Extension(pool))
}
