use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use detect_client::post_frame;
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the detection server to connect to
    #[clap(long, default_value = "127.0.0.1:8000")]
    address: String,

    /// Resend all images in a loop with this pause in milliseconds
    #[clap(long)]
    interval_ms: Option<u64>,

    /// Image files to upload
    #[clap(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut frames = Vec::with_capacity(args.images.len());
    for path in args.images.iter() {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame.jpg".into());
        frames.push((file_name, data));
    }

    log::info!(
        "Sending {} images to detection server at {}",
        frames.len(),
        &args.address
    );

    let client = reqwest::Client::new();
    loop {
        for (file_name, data) in frames.iter() {
            match post_frame(&client, &args.address, file_name, data.clone()).await {
                Ok(response) => {
                    log::info!("{}: {} detections", file_name, response.results.len());
                    for detection in response.results.iter() {
                        let [x1, y1, x2, y2] = detection.bbox;
                        log::info!(
                            "  {} ({}) {:.1}% at ({x1:.0}, {y1:.0}) - ({x2:.0}, {y2:.0})",
                            detection.tag,
                            detection.class_id,
                            detection.confidence * 100.0,
                        );
                    }
                }
                Err(err) => log::error!("{}: {:#}", file_name, err),
            }
        }

        match args.interval_ms {
            Some(interval_ms) => tokio::time::sleep(Duration::from_millis(interval_ms)).await,
            None => break,
        }
    }

    Ok(())
}
