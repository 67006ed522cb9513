use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use log::warn;
use reqwest::Client;
use std::io::Cursor;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(JPEG_MAGIC)
}

/// Re-encodes any decodable image as JPEG; JPEG input is passed through untouched.
pub fn to_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    if is_jpeg(bytes) {
        return Ok(bytes.to_vec());
    }
    let decoded = image::load_from_memory(bytes).context("unrecognised preview image format")?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .to_rgb8()
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("failed to encode preview as JPEG")?;
    Ok(out.into_inner())
}

pub async fn fetch_preview_bytes(
    client: &Client,
    image_url: &str,
    token: Option<&str>,
) -> Result<Vec<u8>> {
    let mut request = client.get(image_url);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("failed to request image {image_url}"))?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "image request for {image_url} returned status {}",
            response.status()
        ));
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to download image bytes from {image_url}"))?;

    match to_jpeg(&bytes) {
        Ok(jpeg) => Ok(jpeg),
        Err(err) => {
            warn!("Keeping original bytes for {image_url}: {err}");
            Ok(bytes.to_vec())
        }
    }
}
