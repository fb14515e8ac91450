//! Configuration of the model and the inference worker pool.
//!
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Result};

/// Fixed frame resolution, written as `WIDTHxHEIGHT` on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for FrameSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(&['x', 'X'][..])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;

        let width: u32 = width
            .trim()
            .parse()
            .map_err(|e| format!("invalid width {width:?}: {e}"))?;
        let height: u32 = height
            .trim()
            .parse()
            .map_err(|e| format!("invalid height {height:?}: {e}"))?;

        if width == 0 || height == 0 {
            return Err(format!("frame size must be non-zero, got {s:?}"));
        }

        Ok(Self { width, height })
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Settings of the ONNX detector.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    /// Optional labels file with one class name per line. COCO names are used otherwise.
    pub labels_path: Option<PathBuf>,
    /// Side length of the square network input.
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("yolov8n.onnx"),
            labels_path: None,
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.7,
            max_detections: 300,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            bail!("input size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            bail!("confidence threshold {} not in [0, 1]", self.conf_threshold);
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            bail!("IoU threshold {} not in [0, 1]", self.iou_threshold);
        }
        if self.max_detections == 0 {
            bail!("max detections must be non-zero");
        }

        Ok(())
    }
}

/// Settings of the inference worker pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of frames running inference at the same time.
    pub workers: usize,
    /// Number of frames that may wait for a free worker before requests are rejected.
    pub queue_capacity: usize,
    /// How long a request waits for its result. `None` waits indefinitely.
    pub infer_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: 16,
            infer_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("worker pool needs at least one worker");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be non-zero");
        }
        if self.infer_timeout == Some(Duration::ZERO) {
            bail!("inference timeout must be non-zero");
        }

        Ok(())
    }
}

/// One worker per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
