//! Page image → base64 PNG attachment for vision models.
//!
//! PNG keeps glyph edges intact; JPEG ringing around small text measurably
//! hurts recognition. `detail: "high"` asks OpenAI-style APIs for the tiled
//! high-resolution path instead of a single downscaled tile.

use crate::error::Doc2MdError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

pub fn encode_png(img: &DynamicImage) -> Result<ImageData, Doc2MdError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| Doc2MdError::ocr("Failed to encode page image", e))?;

    let b64 = STANDARD.encode(&buf);
    debug!(png_bytes = buf.len(), base64_bytes = b64.len(), "Encoded page image");
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
