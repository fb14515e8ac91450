//! JSON protocol of the detection endpoint.
//!
use serde::{Deserialize, Serialize};

/// One detected object instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    /// Corner points `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]` in pixels.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
    pub tag: String,
}

/// Response body of `POST /detect/`.
///
/// `results` is always present. `error` is only set when the frame could not be processed, which
/// lets callers tell an empty scene apart from a failure.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DetectionResponse {
    pub results: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Size of the frames that `GET /frame_size` reports boxes in.
///
/// Served as `null` when frames are not resized and boxes use the uploaded frame's pixels.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl DetectionResponse {
    pub fn new(results: Vec<Detection>) -> Self {
        Self {
            results,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
