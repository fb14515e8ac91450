//! Object detection on uploaded camera frames, served over HTTP.

pub mod config;
pub mod endpoints;
pub mod error;
pub mod inferer;
pub mod labels;
pub mod meter;
pub mod nn;
pub mod pipeline;
pub mod router;
