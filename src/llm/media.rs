use std::io::Cursor;

use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageFormat};
use tracing::warn;

use crate::utils::http::get_http_client;

const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

fn gemini_supports_image_mime(mime_type: &str) -> bool {
    matches!(mime_type, "image/png" | "image/jpeg" | "image/webp")
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Fetches an uploaded file once. Failures are logged and reported as `None`.
pub async fn download_media(url: &str) -> Option<Vec<u8>> {
    let client = get_http_client();
    let response = match client.get(url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            // File URLs embed the bot token.
            let timeout = err.is_timeout();
            let connect = err.is_connect();
            warn!(
                "Failed to fetch media: {} (timeout={}, connect={})",
                err.without_url(),
                timeout,
                connect
            );
            return None;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            "Media download failed with status {}: {}",
            status,
            truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
        );
        return None;
    }

    match response.bytes().await {
        Ok(bytes) => Some(bytes.to_vec()),
        Err(err) => {
            warn!("Failed to read media bytes: {}", err.without_url());
            None
        }
    }
}

/// Raw bytes ready to be inlined into a Gemini request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A bitmap together with the encoded bytes it came from.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl DecodedImage {
    pub fn from_bitmap(image: DynamicImage) -> Result<Self> {
        let bytes = encode_png(&image)?;
        Ok(Self {
            image,
            bytes,
            mime_type: "image/png".to_string(),
        })
    }

    pub fn payload(&self) -> ImagePayload {
        ImagePayload {
            mime_type: self.mime_type.clone(),
            bytes: self.bytes.clone(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

/// Decodes an uploaded or generated image. Formats the generation API cannot
/// take inline are re-encoded as PNG.
pub fn decode_image(bytes: Vec<u8>, declared_mime: Option<&str>) -> Result<DecodedImage> {
    if bytes.is_empty() {
        return Err(anyhow!("image data is empty"));
    }
    let image = image::load_from_memory(&bytes)
        .map_err(|err| anyhow!("could not decode image: {}", err))?;

    let mime_type = detect_mime_type(&bytes)
        .or_else(|| declared_mime.map(|value| value.to_string()))
        .map(|value| normalize_image_mime_type(&value))
        .unwrap_or_default();

    if gemini_supports_image_mime(&mime_type) {
        return Ok(DecodedImage {
            image,
            bytes,
            mime_type,
        });
    }

    DecodedImage::from_bitmap(image)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| anyhow!("could not encode PNG: {}", err))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_round_trip_keeps_dimensions_and_mime() {
        let bitmap = DynamicImage::new_rgb8(6, 3);
        let png = encode_png(&bitmap).unwrap();

        let decoded = decode_image(png, None).unwrap();
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(decoded.dimensions(), (6, 3));
    }

    #[test]
    fn sniffed_mime_wins_over_declared_mime() {
        let bitmap = DynamicImage::new_rgb8(2, 2);
        let png = encode_png(&bitmap).unwrap();

        let decoded = decode_image(png.clone(), Some("image/gif")).unwrap();
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(decoded.bytes, png);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode_image(b"not an image".to_vec(), Some("image/png")).is_err());
        assert!(decode_image(Vec::new(), None).is_err());
    }
}
