//! Stamps a translucent, rotated "DRAFT" label onto PDF pages and images.
//!
//! The core is [`Compositor`], which turns a page geometry and a
//! [`WatermarkStyle`] into an overlay that never crosses the page margins.
//! [`builder`] and [`raster`] apply it to PDFs and images, and [`batch`]
//! runs many files at once.

pub mod batch;
pub mod builder;
pub mod config;
pub mod error;
pub mod font;
pub mod geometry;
#[cfg(not(target_arch = "wasm32"))]
pub mod logging;
pub mod pdf;
pub mod raster;
pub mod style;
pub mod watermark;

pub use batch::{BatchProcessor, BatchReport, InputFile, ItemOutcome, OutputFile};
pub use builder::{watermark_pdf, EncodeStrategy, PdfOptions, Quality};
pub use error::{Result, WatermarkError};
pub use font::{resolve_renderer, FontSource, TextRenderer};
pub use geometry::{PageGeometry, Placement};
pub use style::{AnchorPolicy, Color, WatermarkStyle};
pub use watermark::{composite, Compositor, Overlay};

use wasm_bindgen::prelude::*;

fn js_error(e: WatermarkError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Watermark a PDF with the default style and the built-in font.
#[wasm_bindgen]
pub fn process_pdf(pdf_bytes: &[u8], flatten: bool) -> std::result::Result<Vec<u8>, JsValue> {
    let options = PdfOptions {
        strategies: builder::strategies(flatten),
        ..PdfOptions::default()
    };
    let outcome = watermark_pdf(
        pdf_bytes,
        &Compositor::default(),
        &WatermarkStyle::default(),
        &options,
    )
    .map_err(js_error)?;
    Ok(outcome.bytes)
}

/// Watermark a JPEG, PNG, WEBP or TIFF image; the format comes from `file_name`.
#[wasm_bindgen]
pub fn process_image(bytes: &[u8], file_name: &str) -> std::result::Result<Vec<u8>, JsValue> {
    let format = match batch::detect_kind(file_name).map_err(js_error)? {
        batch::InputKind::Image(format) => format,
        batch::InputKind::Pdf => {
            return Err(js_error(WatermarkError::UnsupportedInputFormat(format!(
                "{file_name} is a PDF, use process_pdf"
            ))))
        }
    };
    raster::watermark_image(
        bytes,
        format,
        &Compositor::default(),
        &WatermarkStyle::default(),
        Quality::Lossless.jpeg_quality(),
    )
    .map_err(js_error)
}

#[wasm_bindgen]
pub fn get_page_count(pdf_bytes: &[u8]) -> std::result::Result<usize, JsValue> {
    pdf::page_count(pdf_bytes).map_err(js_error)
}
