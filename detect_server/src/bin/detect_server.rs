//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    config::{default_workers, FrameSize, ModelConfig, PoolConfig},
    inferer::InferPool,
    meter::spawn_meter_logger,
    nn::YoloModel,
    pipeline::DetectPipeline,
    router::build_router,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:8000")]
    server_address: String,

    /// Path to the ONNX detector weights
    #[clap(long, default_value = "yolov8n.onnx")]
    model: PathBuf,

    /// Class labels file with one label per line, COCO labels if not given
    #[clap(long)]
    labels: Option<PathBuf>,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    input_size: u32,

    /// Minimum confidence of reported detections
    #[clap(long, default_value_t = 0.25)]
    conf_threshold: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.7)]
    iou_threshold: f32,

    /// Maximum number of detections per frame
    #[clap(long, default_value_t = 300)]
    max_detections: usize,

    /// Resize uploaded frames to WIDTHxHEIGHT before inference, e.g. 320x240
    #[clap(long)]
    resize: Option<FrameSize>,

    /// Number of frames running inference at once [default: number of cores]
    #[clap(long)]
    workers: Option<usize>,

    /// Number of frames waiting for a worker before requests are rejected
    #[clap(long, default_value_t = 16)]
    queue_capacity: usize,

    /// Give up waiting for an inference result after this many milliseconds
    #[clap(long)]
    infer_timeout_ms: Option<u64>,

    /// Maximum size of an upload in bytes
    #[clap(long, default_value_t = 16 * 1024 * 1024)]
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let model_config = ModelConfig {
        model_path: args.model,
        labels_path: args.labels,
        input_size: args.input_size,
        conf_threshold: args.conf_threshold,
        iou_threshold: args.iou_threshold,
        max_detections: args.max_detections,
    };
    let pool_config = PoolConfig {
        workers: args.workers.unwrap_or_else(default_workers),
        queue_capacity: args.queue_capacity,
        infer_timeout: args.infer_timeout_ms.map(Duration::from_millis),
    };

    // Load the model once, it is shared read-only by all workers
    let model = Arc::new(YoloModel::new(&model_config)?);

    if let Some(size) = args.resize {
        log::info!("Resizing frames to {size} before inference");
    }
    let pipeline = Arc::new(DetectPipeline::new(model, args.resize));
    let pool = Arc::new(InferPool::new(pipeline, &pool_config)?);

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = build_router(pool, args.max_upload_bytes);

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
