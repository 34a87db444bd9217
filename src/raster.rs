//! Watermarking standalone raster images.

use crate::error::{Result, WatermarkError};
use crate::style::WatermarkStyle;
use crate::watermark::Compositor;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Decode `bytes` as `format`, stamp it and re-encode in the same format.
///
/// Dimensions are preserved. An alpha channel is kept only when the input
/// had one; JPEG output uses `jpeg_quality`.
pub fn watermark_image(
    bytes: &[u8],
    format: ImageFormat,
    compositor: &Compositor,
    style: &WatermarkStyle,
    jpeg_quality: u8,
) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let had_alpha = decoded.color().has_alpha();
    let (width, height) = (decoded.width(), decoded.height());

    let mut canvas = decoded.to_rgba8();
    let overlay = compositor.stamp(&mut canvas, 0, style)?;
    debug!(
        width,
        height,
        font_size = overlay.font_size,
        ?format,
        "Stamped image"
    );

    let stamped = if had_alpha {
        DynamicImage::ImageRgba8(canvas)
    } else {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
    };

    encode(&stamped, format, jpeg_quality)
}

fn encode(image: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let written = match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality);
            // JPEG has no alpha channel
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)
        }
        _ => image.write_to(&mut Cursor::new(&mut buf), format),
    };
    written.map_err(|e| WatermarkError::EncodingFailure(format!("{format:?}: {e}")))?;
    Ok(buf)
}
