//! PDF output: stamping overlays into existing documents and rebuilding
//! documents from stamped page rasters.
//!
//! Several [`EncodeStrategy`]s are tried in order, each on a fresh parse of
//! the input, until one produces a document.

use crate::error::{Result, WatermarkError};
use crate::pdf::{self, resolve_to_dict, PageInfo};
use crate::style::WatermarkStyle;
use crate::watermark::{Compositor, Overlay};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, RgbaImage};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info, warn};

/// Image encoding used when pages are rebuilt from rasters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Lossless,
    Jpeg(u8),
}

impl Quality {
    /// JPEG quality to use when the output format has to be JPEG anyway.
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            Quality::Lossless => 95,
            Quality::Jpeg(q) => *q,
        }
    }
}

pub fn parse_quality(s: &str) -> Result<Quality> {
    if s == "lossless" {
        return Ok(Quality::Lossless);
    }
    let q: u8 = s.parse().map_err(|_| {
        WatermarkError::Config(format!("quality must be 'lossless' or 1-100, got '{s}'"))
    })?;
    if !(1..=100).contains(&q) {
        return Err(WatermarkError::Config(format!(
            "quality must be between 1 and 100, got {q}"
        )));
    }
    Ok(Quality::Jpeg(q))
}

/// One way of producing the watermarked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodeStrategy {
    /// Stamp each page's embedded raster and rebuild the document from them.
    Rasterize,
    /// Add the overlay on top of the existing content, then compress streams.
    OverlayCompressed,
    /// Add the overlay on top of the existing content, streams left as found.
    OverlayPlain,
}

impl std::fmt::Display for EncodeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rasterize => "rasterize",
            Self::OverlayCompressed => "overlay-compressed",
            Self::OverlayPlain => "overlay-plain",
        };
        f.write_str(name)
    }
}

/// Default strategy order; flattening puts rasterization first.
pub fn strategies(flatten: bool) -> Vec<EncodeStrategy> {
    let mut list = Vec::with_capacity(3);
    if flatten {
        list.push(EncodeStrategy::Rasterize);
    }
    list.push(EncodeStrategy::OverlayCompressed);
    list.push(EncodeStrategy::OverlayPlain);
    list
}

#[derive(Debug, Clone)]
pub struct PdfOptions {
    /// Overlay resolution in pixels per PDF point.
    pub pixels_per_point: f64,
    /// Cap on the longer page side in pixels; larger pages get a lower resolution.
    pub max_overlay_side: u32,
    pub quality: Quality,
    pub strategies: Vec<EncodeStrategy>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            pixels_per_point: 2.0,
            max_overlay_side: 4096,
            quality: Quality::Lossless,
            strategies: strategies(false),
        }
    }
}

impl PdfOptions {
    fn scale_for(&self, page: &PageInfo) -> f64 {
        let longest = page.width().max(page.height());
        if longest <= 0.0 {
            return self.pixels_per_point;
        }
        self.pixels_per_point
            .min(self.max_overlay_side as f64 / longest)
    }
}

/// `style` with its font floor moved from points to canvas pixels.
fn style_at_scale(style: &WatermarkStyle, pixels_per_point: f64) -> WatermarkStyle {
    let min_font_size = (style.min_font_size as f64 * pixels_per_point).round();
    WatermarkStyle {
        min_font_size: if min_font_size.is_finite() && min_font_size >= 1.0 {
            min_font_size as u32
        } else {
            1
        },
        ..style.clone()
    }
}

/// Result of watermarking one document.
#[derive(Debug, Clone)]
pub struct PdfOutcome {
    pub bytes: Vec<u8>,
    pub strategy: EncodeStrategy,
    pub pages: usize,
    pub stamped: usize,
    /// Pages left unstamped, with the reason.
    pub skipped: Vec<(u32, String)>,
}

/// Watermark every page of a PDF.
///
/// Strategies are tried in order; invalid page geometry on every page is
/// reported immediately since no other strategy can fix it.
pub fn watermark_pdf(
    bytes: &[u8],
    compositor: &Compositor,
    style: &WatermarkStyle,
    options: &PdfOptions,
) -> Result<PdfOutcome> {
    let mut failures = Vec::new();

    for &strategy in &options.strategies {
        let attempt = pdf::load(bytes).and_then(|doc| match strategy {
            EncodeStrategy::Rasterize => rasterize(doc, compositor, style, options),
            EncodeStrategy::OverlayCompressed => overlay(doc, compositor, style, options, true),
            EncodeStrategy::OverlayPlain => overlay(doc, compositor, style, options, false),
        });

        match attempt {
            Ok(mut outcome) => {
                outcome.strategy = strategy;
                info!(
                    %strategy,
                    pages = outcome.pages,
                    stamped = outcome.stamped,
                    "Watermarked PDF"
                );
                return Ok(outcome);
            }
            Err(e @ WatermarkError::InvalidGeometry(_)) => return Err(e),
            Err(e) => {
                warn!(%strategy, error = %e, "PDF strategy failed, trying next");
                failures.push(format!("{strategy}: {e}"));
            }
        }
    }

    Err(WatermarkError::EncodingFailure(if failures.is_empty() {
        "no encoding strategy configured".to_string()
    } else {
        failures.join("; ")
    }))
}

fn overlay(
    mut doc: Document,
    compositor: &Compositor,
    style: &WatermarkStyle,
    options: &PdfOptions,
    compress: bool,
) -> Result<PdfOutcome> {
    let pages = pdf::pages(&doc);
    if pages.is_empty() {
        return Err(WatermarkError::EncodingFailure(
            "document has no pages".to_string(),
        ));
    }

    let built: Vec<(PageInfo, f64, Result<Overlay>)> = pages
        .into_par_iter()
        .map(|page| {
            let scale = options.scale_for(&page);
            let page_style = style_at_scale(style, scale);
            let overlay = page
                .geometry(scale)
                .and_then(|geometry| compositor.build(&geometry, &page_style));
            (page, scale, overlay)
        })
        .collect();

    let total = built.len();
    let mut skipped = Vec::new();
    for (page, scale, overlay) in built {
        match overlay {
            Ok(overlay) => {
                stamp_page(&mut doc, &page, &overlay, scale)?;
                debug!(page = page.number, "Stamped page");
            }
            Err(e) => {
                warn!(page = page.number, error = %e, "Skipping page");
                skipped.push((page.number, e.to_string()));
            }
        }
    }
    all_pages_skipped(total, &skipped)?;

    if compress {
        doc.compress();
    }
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;

    Ok(PdfOutcome {
        bytes,
        strategy: if compress {
            EncodeStrategy::OverlayCompressed
        } else {
            EncodeStrategy::OverlayPlain
        },
        pages: total,
        stamped: total - skipped.len(),
        skipped,
    })
}

fn all_pages_skipped(total: usize, skipped: &[(u32, String)]) -> Result<()> {
    if total > 0 && skipped.len() == total {
        let reasons: Vec<String> = skipped
            .iter()
            .map(|(number, reason)| format!("page {number}: {reason}"))
            .collect();
        return Err(WatermarkError::InvalidGeometry(reasons.join("; ")));
    }
    Ok(())
}

/// Draw `overlay` on top of a page without touching its existing content.
fn stamp_page(doc: &mut Document, page: &PageInfo, overlay: &Overlay, scale: f64) -> Result<()> {
    let image_id = add_overlay_image(doc, &overlay.bitmap)?;
    let name = register_xobject(doc, page.id, image_id)?;

    // raster rows run top-down, PDF y runs bottom-up
    let (ow, oh) = overlay.bitmap.dimensions();
    let page_px_h = page.height() * scale;
    let x = page.media_box[0] + overlay.placement.x as f64 / scale;
    let y = page.media_box[1] + (page_px_h - overlay.placement.y as f64 - oh as f64) / scale;
    let w = ow as f64 / scale;
    let h = oh as f64 / scale;

    let ops = format!("Q\nq\n{w:.4} 0 0 {h:.4} {x:.4} {y:.4} cm\n/{name} Do\nQ\n");
    append_contents(doc, page.id, ops.into_bytes())
}

/// Embed an RGBA bitmap as an RGB image XObject with a gray soft mask.
fn add_overlay_image(doc: &mut Document, bitmap: &RgbaImage) -> Result<ObjectId> {
    let (w, h) = bitmap.dimensions();
    let mut rgb = Vec::with_capacity((w * h * 3) as usize);
    let mut alpha = Vec::with_capacity((w * h) as usize);
    for pixel in bitmap.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
    }

    let smask = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
        },
        deflate(&alpha)?,
    );
    let smask_id = doc.add_object(smask);

    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
            "Filter" => "FlateDecode",
            "SMask" => Object::Reference(smask_id),
        },
        deflate(&rgb)?,
    );
    Ok(doc.add_object(image))
}

/// Add the image to the page's XObject resources under a fresh name.
///
/// Resources are copied onto the page itself, so inherited or shared
/// dictionaries are never modified.
fn register_xobject(doc: &mut Document, page_id: ObjectId, image_id: ObjectId) -> Result<String> {
    let mut resources = {
        let page = doc.get_object(page_id)?.as_dict()?;
        let own = page.get(b"Resources").ok().cloned();
        match own.or_else(|| inherited_resources(doc, page)) {
            Some(obj) => resolve_to_dict(doc, &obj)?,
            None => Dictionary::new(),
        }
    };

    let mut xobjects = match resources.get(b"XObject") {
        Ok(obj) => resolve_to_dict(doc, obj)?,
        Err(_) => Dictionary::new(),
    };

    let mut name = "DraftWm".to_string();
    let mut n = 1;
    while xobjects.has(name.as_bytes()) {
        n += 1;
        name = format!("DraftWm{n}");
    }
    xobjects.set(name.as_bytes(), Object::Reference(image_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Resources", Object::Dictionary(resources));
    Ok(name)
}

fn inherited_resources(doc: &Document, page: &Dictionary) -> Option<Object> {
    let mut parent = page.get(b"Parent").ok()?.as_reference().ok()?;
    for _ in 0..64 {
        let node = doc.get_object(parent).ok()?.as_dict().ok()?;
        if let Ok(res) = node.get(b"Resources") {
            return Some(res.clone());
        }
        parent = node.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

/// Wrap the existing content in `q ... Q` and append `ops` after it.
///
/// `ops` must start by closing that outer `q`.
fn append_contents(doc: &mut Document, page_id: ObjectId, ops: Vec<u8>) -> Result<()> {
    let existing: Vec<Object> = {
        let page = doc.get_object(page_id)?.as_dict()?;
        match page.get(b"Contents") {
            Ok(Object::Reference(id)) => match doc.get_object(*id)? {
                Object::Array(items) => items.clone(),
                _ => vec![Object::Reference(*id)],
            },
            Ok(Object::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    };

    let save_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let stamp_id = doc.add_object(Stream::new(dictionary! {}, ops));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(save_id));
    contents.extend(existing);
    contents.push(Object::Reference(stamp_id));

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Contents", Object::Array(contents));
    Ok(())
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// A stamped page raster plus the page attributes it is rebuilt with.
pub struct RasterPage {
    pub image: DynamicImage,
    pub media_box: [f64; 4],
    pub rotation: u16,
}

fn rasterize(
    doc: Document,
    compositor: &Compositor,
    style: &WatermarkStyle,
    options: &PdfOptions,
) -> Result<PdfOutcome> {
    let pages = pdf::pages(&doc);
    if pages.is_empty() {
        return Err(WatermarkError::EncodingFailure(
            "document has no pages".to_string(),
        ));
    }

    let total = pages.len();
    let mut extracted = Vec::with_capacity(total);
    for page in pages {
        let raster = pdf::extract_page_image(&doc, page.id).map_err(|e| {
            WatermarkError::EncodingFailure(format!("page {}: {e}", page.number))
        })?;
        extracted.push((page, raster));
    }

    let stamped: Vec<(RasterPage, Option<(u32, String)>)> = extracted
        .into_par_iter()
        .map(|(page, raster)| {
            let mut canvas = raster.to_rgba8();
            let scale = if page.width() > 0.0 {
                canvas.width() as f64 / page.width()
            } else {
                1.0
            };
            let page_style = style_at_scale(style, scale);
            let skipped = match compositor.stamp(&mut canvas, page.rotation as i64, &page_style) {
                Ok(_) => None,
                Err(e) => {
                    warn!(page = page.number, error = %e, "Skipping page");
                    Some((page.number, e.to_string()))
                }
            };
            (
                RasterPage {
                    image: DynamicImage::ImageRgba8(canvas),
                    media_box: page.media_box,
                    rotation: page.rotation,
                },
                skipped,
            )
        })
        .collect();

    let (rasters, skipped): (Vec<RasterPage>, Vec<Option<(u32, String)>>) =
        stamped.into_iter().unzip();
    let skipped: Vec<(u32, String)> = skipped.into_iter().flatten().collect();
    all_pages_skipped(total, &skipped)?;

    let bytes = build_pdf_bytes(&rasters, &options.quality)?;
    Ok(PdfOutcome {
        bytes,
        strategy: EncodeStrategy::Rasterize,
        pages: total,
        stamped: total - skipped.len(),
        skipped,
    })
}

/// Build a new document with one full-page image per page.
pub fn build_pdf_bytes(pages: &[RasterPage], quality: &Quality) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.4");

    let pages_id = doc.new_object_id();
    let mut page_ids: Vec<Object> = Vec::new();

    for page in pages {
        let image_stream = encode_image_stream(&page.image, quality)?;
        let img_id = doc.add_object(image_stream);

        let [x0, y0, x1, y1] = page.media_box;
        let content = format!(
            "q\n{:.4} 0 0 {:.4} {:.4} {:.4} cm\n/Im0 Do\nQ\n",
            x1 - x0,
            y1 - y0,
            x0,
            y0
        );
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let mut page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![x0.into(), y0.into(), x1.into(), y1.into()],
            "Contents" => Object::Reference(content_id),
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Im0" => Object::Reference(img_id),
                },
            },
        };
        if page.rotation != 0 {
            page_dict.set("Rotate", page.rotation as i64);
        }
        let page_id = doc.add_object(page_dict);
        page_ids.push(Object::Reference(page_id));
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => page_ids,
        "Count" => pages.len() as i64,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    };
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;

    let mode = match quality {
        Quality::Lossless => "Flate lossless".to_string(),
        Quality::Jpeg(q) => format!("JPEG q={}", q),
    };
    debug!(
        pages = pages.len(),
        size_kb = bytes.len() / 1024,
        mode,
        "Rebuilt PDF from page rasters"
    );

    Ok(bytes)
}

fn encode_image_stream(img: &DynamicImage, quality: &Quality) -> Result<Stream> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();

    match quality {
        Quality::Lossless => {
            let compressed = deflate(rgb.as_raw())?;
            let dict = dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8_i64,
                "Filter" => "FlateDecode",
            };
            Ok(Stream::new(dict, compressed))
        }
        Quality::Jpeg(q) => {
            let mut buf: Vec<u8> = Vec::new();
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, *q);
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(encoder)
                .map_err(|e| WatermarkError::EncodingFailure(e.to_string()))?;

            let dict = dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8_i64,
                "Filter" => "DCTDecode",
            };
            Ok(Stream::new(dict, buf))
        }
    }
}
