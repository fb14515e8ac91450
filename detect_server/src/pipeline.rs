//! Processing of a single uploaded frame: decode, resize, infer, map.
//!
use std::sync::Arc;

use common::protocol::Detection;
use image::RgbImage;

use crate::{
    config::FrameSize,
    error::DetectError,
    nn::{InferModel, RawDetection},
};

pub struct DetectPipeline {
    model: Arc<dyn InferModel>,
    resize: Option<FrameSize>,
}

impl DetectPipeline {
    pub fn new(model: Arc<dyn InferModel>, resize: Option<FrameSize>) -> Self {
        Self { model, resize }
    }

    /// Size frames are resized to before inference, if any.
    pub fn resize(&self) -> Option<FrameSize> {
        self.resize
    }

    /// Run the detector on an encoded image.
    ///
    /// Blocks for the duration of the inference, so it must not be called on an async executor
    /// thread.
    pub fn process(&self, data: &[u8]) -> Result<Vec<Detection>, DetectError> {
        let frame = decode_frame(data, self.resize)?;

        let raw_detections = self.model.run(&frame).map_err(DetectError::Inference)?;
        log::debug!(
            "{} detections on {}x{} frame",
            raw_detections.len(),
            frame.width(),
            frame.height()
        );

        raw_detections
            .into_iter()
            .map(|raw| self.to_detection(raw))
            .collect()
    }

    fn to_detection(&self, raw: RawDetection) -> Result<Detection, DetectError> {
        let tag = self
            .model
            .class_name(raw.class_id)
            .filter(|tag| !tag.is_empty())
            .ok_or(DetectError::UnknownClass(raw.class_id))?;
        let class_id =
            u32::try_from(raw.class_id).map_err(|_| DetectError::UnknownClass(raw.class_id))?;

        Ok(Detection {
            bbox: raw.bbox,
            confidence: raw.confidence,
            class_id,
            tag: tag.to_owned(),
        })
    }
}

/// Decode an uploaded image into a 3-channel frame, optionally resized to a fixed resolution.
pub fn decode_frame(data: &[u8], resize: Option<FrameSize>) -> Result<RgbImage, DetectError> {
    if data.is_empty() {
        return Err(DetectError::EmptyUpload);
    }

    // Alpha channels are dropped and grayscale is expanded
    let frame = image::load_from_memory(data)?.to_rgb8();

    Ok(match resize {
        Some(size) if frame.dimensions() != (size.width, size.height) => image::imageops::resize(
            &frame,
            size.width,
            size.height,
            image::imageops::FilterType::Triangle,
        ),
        _ => frame,
    })
}
