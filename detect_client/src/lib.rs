//! Client for uploading frames to the detection server.
//!
use std::path::Path;

use anyhow::{bail, Result};
use common::protocol::DetectionResponse;
use reqwest::{multipart, Client};

/// Upload an encoded image to the detection endpoint of the server at `address`.
///
/// A non-success status is turned into an error carrying the server's explanation.
pub async fn post_frame(
    client: &Client,
    address: &str,
    file_name: &str,
    data: Vec<u8>,
) -> Result<DetectionResponse> {
    let part = multipart::Part::bytes(data)
        .file_name(file_name.to_owned())
        .mime_str(mime_for_path(file_name))?;
    let form = multipart::Form::new().part("file", part);

    let resp = client
        .post(format!("http://{address}/detect/"))
        .multipart(form)
        .send()
        .await?;
    let status = resp.status();

    let response: DetectionResponse = resp.json().await?;
    if !status.is_success() {
        bail!(
            "server answered {status}: {}",
            response.error.as_deref().unwrap_or("no reason given")
        );
    }

    Ok(response)
}

/// Guess the mime type of an image from its file extension.
pub fn mime_for_path(path: impl AsRef<Path>) -> &'static str {
    let extension = path
        .as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif" | "tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}
