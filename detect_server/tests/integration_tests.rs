use std::{
    io::Cursor,
    net::SocketAddr,
    path::Path,
    sync::{mpsc as std_mpsc, Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use common::protocol::{DetectionResponse, FrameDims};
use detect_server::{
    config::{FrameSize, ModelConfig, PoolConfig},
    inferer::InferPool,
    nn::{InferModel, RawDetection, YoloModel},
    pipeline::DetectPipeline,
    router::build_router,
};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use reqwest::{multipart, Client, StatusCode};

/// Reports one box covering the whole frame, tagged with the red value of its first pixel.
struct EchoModel;

impl InferModel for EchoModel {
    fn run(&self, frame: &RgbImage) -> Result<Vec<RawDetection>> {
        Ok(vec![RawDetection {
            bbox: [0.0, 0.0, frame.width() as f32, frame.height() as f32],
            confidence: 0.9,
            class_id: frame[(0, 0)][0] as usize,
        }])
    }

    fn class_name(&self, class_id: usize) -> Option<&str> {
        match class_id {
            0 => Some("zero"),
            200 => Some("two hundred"),
            1..=255 => Some("label"),
            _ => None,
        }
    }
}

/// Never detects anything.
struct EmptyModel;

impl InferModel for EmptyModel {
    fn run(&self, _frame: &RgbImage) -> Result<Vec<RawDetection>> {
        Ok(vec![])
    }

    fn class_name(&self, _class_id: usize) -> Option<&str> {
        None
    }
}

/// Blocks every inference until released by the test.
struct GatedModel {
    started_tx: tokio::sync::mpsc::UnboundedSender<()>,
    release_rx: Mutex<std_mpsc::Receiver<()>>,
}

impl InferModel for GatedModel {
    fn run(&self, _frame: &RgbImage) -> Result<Vec<RawDetection>> {
        self.started_tx.send(())?;
        self.release_rx
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .recv()?;
        Ok(vec![])
    }

    fn class_name(&self, _class_id: usize) -> Option<&str> {
        None
    }
}

struct SlowModel;

impl InferModel for SlowModel {
    fn run(&self, _frame: &RgbImage) -> Result<Vec<RawDetection>> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(vec![])
    }

    fn class_name(&self, _class_id: usize) -> Option<&str> {
        None
    }
}

const DEFAULT_POOL: PoolConfig = PoolConfig {
    workers: 2,
    queue_capacity: 32,
    infer_timeout: None,
};

const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;

async fn spawn_server(
    model: Arc<dyn InferModel>,
    resize: Option<FrameSize>,
) -> Result<SocketAddr> {
    let (addr, _pool) = spawn_server_with(model, resize, &DEFAULT_POOL, MAX_UPLOAD_BYTES)?;
    Ok(addr)
}

/// Serve on an ephemeral port, handing out the pool so tests can occupy it directly.
fn spawn_server_with(
    model: Arc<dyn InferModel>,
    resize: Option<FrameSize>,
    pool_config: &PoolConfig,
    max_upload_bytes: usize,
) -> Result<(SocketAddr, Arc<InferPool>)> {
    let pipeline = Arc::new(DetectPipeline::new(model, resize));
    let pool = Arc::new(InferPool::new(pipeline, pool_config)?);
    let app = build_router(Arc::clone(&pool), max_upload_bytes);

    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
    tokio::spawn(server);

    Ok((addr, pool))
}

fn encode(frame: RgbImage, format: ImageOutputFormat) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(frame).write_to(&mut buf, format)?;
    Ok(buf.into_inner())
}

fn solid_png(width: u32, height: u32, red: u8) -> Result<Vec<u8>> {
    encode(
        RgbImage::from_pixel(width, height, Rgb([red, 0, 0])),
        ImageOutputFormat::Png,
    )
}

async fn post_file(
    client: &Client,
    addr: SocketAddr,
    data: Vec<u8>,
) -> Result<(StatusCode, DetectionResponse)> {
    let part = multipart::Part::bytes(data).file_name("frame.jpg");
    let form = multipart::Form::new().part("file", part);

    let resp = client
        .post(format!("http://{addr}/detect/"))
        .multipart(form)
        .send()
        .await?;
    let status = resp.status();

    Ok((status, resp.json().await?))
}

#[tokio::test]
async fn test_detect_jpeg_upload() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), None).await?;
    let jpeg = encode(
        RgbImage::from_pixel(640, 480, Rgb([0, 0, 0])),
        ImageOutputFormat::Jpeg(90),
    )?;

    let (status, response) = post_file(&Client::new(), addr, jpeg).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(response.error.is_none());
    assert_eq!(response.results.len(), 1);

    let detection = &response.results[0];
    assert_eq!(detection.bbox, [0.0, 0.0, 640.0, 480.0]);
    assert!((0.0..=1.0).contains(&detection.confidence));
    assert_eq!(detection.class_id, 0);
    assert_eq!(detection.tag, "zero");

    Ok(())
}

#[tokio::test]
async fn test_no_detections_is_success() -> Result<()> {
    let addr = spawn_server(Arc::new(EmptyModel), None).await?;

    let (status, response) = post_file(&Client::new(), addr, solid_png(32, 32, 0)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response, DetectionResponse::new(vec![]));

    Ok(())
}

#[tokio::test]
async fn test_corrupt_and_empty_payloads_are_rejected() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), None).await?;
    let client = Client::new();

    for payload in [b"not an image at all".to_vec(), Vec::new()] {
        let (status, response) = post_file(&client, addr, payload).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(response.results.is_empty());
        assert!(response.is_failure());
    }

    Ok(())
}

#[tokio::test]
async fn test_missing_file_field() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), None).await?;

    let form = multipart::Form::new().text("note", "no image here");
    let resp = Client::new()
        .post(format!("http://{addr}/detect/"))
        .multipart(form)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let response: DetectionResponse = resp.json().await?;
    assert!(response.results.is_empty());
    assert_eq!(response.error.as_deref(), Some("no `file` field in upload"));

    Ok(())
}

#[tokio::test]
async fn test_non_multipart_request_gets_json_error() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), None).await?;

    let resp = Client::new()
        .post(format!("http://{addr}/detect/"))
        .body("raw bytes")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let response: DetectionResponse = resp.json().await?;
    assert!(response.is_failure());

    Ok(())
}

#[tokio::test]
async fn test_concurrent_uploads_do_not_mix() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), None).await?;
    let client = Client::new();

    let requests = (0..10u32).map(|i| {
        let client = client.clone();
        async move {
            let (width, height, red) = (100 + i * 10, 80 + i * 5, (i * 20) as u8);
            let data = solid_png(width, height, red)?;
            let (status, response) = post_file(&client, addr, data).await?;
            Ok::<_, anyhow::Error>((width, height, red, status, response))
        }
    });

    for result in futures::future::join_all(requests).await {
        let (width, height, red, status, response) = result?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.results.len(), 1);
        assert_eq!(
            response.results[0].bbox,
            [0.0, 0.0, width as f32, height as f32]
        );
        assert_eq!(response.results[0].class_id, red as u32);
    }

    Ok(())
}

#[tokio::test]
async fn test_resize_bounds_boxes() -> Result<()> {
    let addr = spawn_server(Arc::new(EchoModel), Some(FrameSize::new(320, 240))).await?;

    let (status, response) = post_file(&Client::new(), addr, solid_png(640, 480, 200)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.results[0].bbox, [0.0, 0.0, 320.0, 240.0]);
    assert_eq!(response.results[0].tag, "two hundred");

    Ok(())
}

#[tokio::test]
async fn test_index_and_healthcheck() -> Result<()> {
    let addr = spawn_server(Arc::new(EmptyModel), None).await?;
    let client = Client::new();

    let health = client.get(format!("http://{addr}/healthcheck")).send().await?;
    assert_eq!(health.text().await?, "healthy");

    let index = client.get(format!("http://{addr}/")).send().await?;
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.text().await?.contains("/detect/"));

    Ok(())
}

#[tokio::test]
async fn test_full_queue_returns_service_unavailable() -> Result<()> {
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let model = GatedModel {
        started_tx,
        release_rx: Mutex::new(release_rx),
    };
    let pool_config = PoolConfig {
        workers: 1,
        queue_capacity: 1,
        infer_timeout: None,
    };
    let (addr, pool) = spawn_server_with(Arc::new(model), None, &pool_config, MAX_UPLOAD_BYTES)?;

    // Occupy the only worker and the only queue slot
    let running = pool.submit(Bytes::from(solid_png(8, 8, 0)?))?;
    tokio::time::timeout(Duration::from_secs(5), started_rx.recv()).await?;
    let queued = pool.submit(Bytes::from(solid_png(8, 8, 0)?))?;

    let (status, response) = post_file(&Client::new(), addr, solid_png(8, 8, 0)?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.results.is_empty());
    assert_eq!(response.error.as_deref(), Some("inference queue is full"));

    release_tx.send(())?;
    release_tx.send(())?;
    assert!(running.wait().await?.is_empty());
    assert!(queued.wait().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_slow_inference_returns_gateway_timeout() -> Result<()> {
    let pool_config = PoolConfig {
        workers: 1,
        queue_capacity: 4,
        infer_timeout: Some(Duration::from_millis(50)),
    };
    let (addr, _pool) =
        spawn_server_with(Arc::new(SlowModel), None, &pool_config, MAX_UPLOAD_BYTES)?;

    let (status, response) = post_file(&Client::new(), addr, solid_png(8, 8, 0)?).await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(response.results.is_empty());
    assert_eq!(response.error.as_deref(), Some("inference timed out"));

    Ok(())
}

#[tokio::test]
async fn test_oversized_upload_returns_payload_too_large() -> Result<()> {
    let (addr, _pool) = spawn_server_with(Arc::new(EchoModel), None, &DEFAULT_POOL, 1024)?;

    let (status, response) = post_file(&Client::new(), addr, vec![0u8; 4096]).await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response.results.is_empty());
    assert!(response.is_failure());

    Ok(())
}

#[tokio::test]
async fn test_frame_size_reports_resize() -> Result<()> {
    let client = Client::new();

    let addr = spawn_server(Arc::new(EmptyModel), Some(FrameSize::new(320, 240))).await?;
    let size: Option<FrameDims> = client
        .get(format!("http://{addr}/frame_size"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(
        size,
        Some(FrameDims {
            width: 320,
            height: 240
        })
    );

    let addr = spawn_server(Arc::new(EmptyModel), None).await?;
    let size: Option<FrameDims> = client
        .get(format!("http://{addr}/frame_size"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(size, None);

    Ok(())
}

/// End-to-end check with real weights.
///
/// Runs only if `DETECT_MODEL` (default `yolov8n.onnx`) and `DETECT_TEST_IMAGE` point to existing
/// files. `DETECT_TEST_TAG` is the label expected on the image (default `person`).
#[tokio::test]
async fn test_yolo_model_end_to_end() -> Result<()> {
    let model_path = std::env::var("DETECT_MODEL").unwrap_or_else(|_| "yolov8n.onnx".into());
    let image_path = std::env::var("DETECT_TEST_IMAGE").unwrap_or_default();
    if !Path::new(&model_path).is_file() || !Path::new(&image_path).is_file() {
        println!("Skipping end-to-end test, model or test image not available");
        return Ok(());
    }
    let expected_tag = std::env::var("DETECT_TEST_TAG").unwrap_or_else(|_| "person".into());

    let model = YoloModel::new(&ModelConfig {
        model_path: model_path.into(),
        ..Default::default()
    })?;
    let addr = spawn_server(Arc::new(model), None).await?;

    let data = std::fs::read(&image_path)?;
    let (width, height) = image::load_from_memory(&data)?.to_rgb8().dimensions();
    let (status, response) = post_file(&Client::new(), addr, data).await?;
    assert_eq!(status, StatusCode::OK);

    for detection in response.results.iter() {
        let [x1, y1, x2, y2] = detection.bbox;
        assert!(0.0 <= x1 && x1 <= x2 && x2 <= width as f32);
        assert!(0.0 <= y1 && y1 <= y2 && y2 <= height as f32);
        assert!(!detection.tag.is_empty());
    }
    assert!(
        response.results.iter().any(|d| d.tag == expected_tag),
        "expected a {expected_tag} in {:?}",
        response.results
    );

    Ok(())
}
