//! Neural network module wrapping the ONNX object detector.
//!
use anyhow::{bail, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::{
    config::ModelConfig,
    labels::{coco_labels, load_labels},
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Bounding box `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
pub type Bbox = [f32; 4];

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of box coordinates in front of the class scores of a prediction.
const BOX_ROWS: usize = 4;

/// A detection as produced by the model, in pixel coordinates of the frame it ran on.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: Bbox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Object detector shared by all inference workers.
pub trait InferModel: Send + Sync {
    /// Detect objects on a frame. Results are ordered by descending confidence.
    fn run(&self, frame: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Human-readable name of a class id.
    fn class_name(&self, class_id: usize) -> Option<&str>;
}

/// Thresholds applied when turning raw network output into detections.
#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

/// YOLOv8-style detector running on tract.
pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    params: DecodeParams,
    labels: Vec<String>,
}

impl YoloModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let labels = match &config.labels_path {
            Some(path) => load_labels(path)?,
            None => coco_labels(),
        };

        log::info!(
            "Loading model {} with input size {}",
            config.model_path.display(),
            config.input_size
        );
        let size = config.input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(&config.model_path)
            .with_context(|| format!("failed to read model {}", config.model_path.display()))?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;
        log::info!("Model ready with {} class labels", labels.len());

        Ok(Self {
            model,
            input_size: config.input_size,
            params: DecodeParams {
                conf_threshold: config.conf_threshold,
                iou_threshold: config.iou_threshold,
                max_detections: config.max_detections,
            },
            labels,
        })
    }

    fn preproc(&self, frame: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized: RgbImage =
            image::imageops::resize(frame, size, size, image::imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl InferModel for YoloModel {
    fn run(&self, frame: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = self.preproc(frame);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        let output = raw_nn_out[0].to_array_view::<f32>()?;
        if output.ndim() != 3 || output.shape()[0] != 1 {
            bail!("unexpected output shape {:?}", output.shape());
        }
        let predictions = output
            .index_axis(tract_ndarray::Axis(0), 0)
            .into_dimensionality::<tract_ndarray::Ix2>()?;

        let (width, height) = frame.dimensions();
        let scale = (
            width as f32 / self.input_size as f32,
            height as f32 / self.input_size as f32,
        );

        decode_predictions(
            predictions,
            self.labels.len(),
            scale,
            (width, height),
            &self.params,
        )
    }

    fn class_name(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }
}

/// Turn network predictions into detections in frame coordinates.
///
/// `predictions` has one column per candidate with the rows `cx, cy, w, h` followed by one score
/// per class, all in network input pixels. The transposed layout with one row per candidate is
/// recognized by its `4 + num_classes` columns. `scale` maps input pixels to frame pixels and
/// boxes are clamped to `frame_size`.
pub fn decode_predictions(
    predictions: tract_ndarray::ArrayView2<f32>,
    num_classes: usize,
    scale: (f32, f32),
    frame_size: (u32, u32),
    params: &DecodeParams,
) -> Result<Vec<RawDetection>> {
    if num_classes == 0 {
        bail!("cannot decode predictions without classes");
    }
    let rows = BOX_ROWS + num_classes;
    let predictions = match predictions.dim() {
        (nrows, _) if nrows == rows => predictions,
        (_, ncols) if ncols == rows => predictions.reversed_axes(),
        (nrows, ncols) => bail!(
            "prediction of shape {nrows}x{ncols} does not hold box coordinates and {num_classes} class scores"
        ),
    };

    let (sx, sy) = scale;
    let (max_x, max_y) = (frame_size.0 as f32, frame_size.1 as f32);

    let candidates: Vec<RawDetection> = predictions
        .columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, confidence) = column
                .iter()
                .skip(BOX_ROWS)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if confidence <= params.conf_threshold {
                return None;
            }

            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            let bbox = [
                ((cx - w / 2.0) * sx).clamp(0.0, max_x),
                ((cy - h / 2.0) * sy).clamp(0.0, max_y),
                ((cx + w / 2.0) * sx).clamp(0.0, max_x),
                ((cy + h / 2.0) * sy).clamp(0.0, max_y),
            ];

            Some(RawDetection {
                bbox,
                confidence: confidence.clamp(0.0, 1.0),
                class_id,
            })
        })
        .collect();

    Ok(non_maximum_suppression(
        candidates,
        params.iou_threshold,
        params.max_detections,
    ))
}

/// Run class-aware non-maximum-suppression on candidate detections.
///
/// Start with the most confident candidate and iterate over all others in the order of sinking
/// confidence. A candidate is selected only if it does not overlap an already selected detection
/// of the same class by more than `max_iou`. Stop once `max_detections` are selected.
pub fn non_maximum_suppression(
    mut candidates: Vec<RawDetection>,
    max_iou: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    // Ascending order, so that popping yields the most confident candidate
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<RawDetection> = Vec::new();
    'candidates: while let Some(candidate) = candidates.pop() {
        if selected.len() >= max_detections {
            break;
        }

        for kept in selected.iter() {
            if kept.class_id == candidate.class_id && iou(&candidate.bbox, &kept.bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box lies below or to the
    // right of its bottom right corner and the area is zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// An ill-defined box with the bottom-right point above or left of the top-left point has area
/// zero.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
