//! PDF decoding: page lookup, page geometry and embedded page rasters.

use crate::error::{Result, WatermarkError};
use crate::geometry::{normalize_rotation, PageGeometry};
use flate2::read::ZlibDecoder;
use image::{DynamicImage, GrayImage, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::io::{Cursor, Read};
use tracing::warn;

/// US Letter, used when a page carries no usable MediaBox anywhere in its tree.
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// One page of a loaded document.
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    /// 1-based page number.
    pub number: u32,
    pub id: ObjectId,
    /// `[llx, lly, urx, ury]` in points, normalized so `ll <= ur`.
    pub media_box: [f64; 4],
    /// Display rotation in degrees, one of 0, 90, 180, 270.
    pub rotation: u16,
}

impl PageInfo {
    pub fn width(&self) -> f64 {
        self.media_box[2] - self.media_box[0]
    }

    pub fn height(&self) -> f64 {
        self.media_box[3] - self.media_box[1]
    }

    /// Geometry of the raw page box in pixels at `pixels_per_point`.
    pub fn geometry(&self, pixels_per_point: f64) -> Result<PageGeometry> {
        PageGeometry::new(
            self.width() * pixels_per_point,
            self.height() * pixels_per_point,
            self.rotation as i64,
        )
    }
}

/// Parse a document from memory, refusing encrypted files.
pub fn load(bytes: &[u8]) -> Result<Document> {
    let doc = Document::load_mem(bytes)?;
    if doc.trailer.get(b"Encrypt").is_ok() {
        return Err(WatermarkError::EncodingFailure(
            "document is encrypted".to_string(),
        ));
    }
    Ok(doc)
}

pub fn page_count(bytes: &[u8]) -> Result<usize> {
    Ok(load(bytes)?.get_pages().len())
}

/// All pages in reading order with their inherited box and rotation.
pub fn pages(doc: &Document) -> Vec<PageInfo> {
    doc.get_pages()
        .into_iter()
        .map(|(number, id)| PageInfo {
            number,
            id,
            media_box: media_box(doc, id),
            rotation: rotation(doc, id, number),
        })
        .collect()
}

fn media_box(doc: &Document, page_id: ObjectId) -> [f64; 4] {
    let Some(values) = inherited(doc, page_id, b"MediaBox")
        .and_then(|obj| resolve(doc, obj).ok())
        .and_then(|obj| obj.as_array().ok())
    else {
        return DEFAULT_MEDIA_BOX;
    };

    let numbers: Vec<f64> = values
        .iter()
        .filter_map(|v| resolve(doc, v).ok().and_then(number))
        .collect();
    match numbers.as_slice() {
        [x0, y0, x1, y1] => [x0.min(*x1), y0.min(*y1), x0.max(*x1), y0.max(*y1)],
        _ => DEFAULT_MEDIA_BOX,
    }
}

fn rotation(doc: &Document, page_id: ObjectId, number: u32) -> u16 {
    let raw = inherited(doc, page_id, b"Rotate")
        .and_then(|obj| resolve(doc, obj).ok())
        .and_then(|obj| obj.as_i64().ok())
        .unwrap_or(0);
    normalize_rotation(raw).unwrap_or_else(|_| {
        warn!(page = number, rotate = raw, "Ignoring invalid page rotation");
        0
    })
}

/// Look a key up on the page, then on its ancestors in the page tree.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = doc.get_object(page_id).ok()?.as_dict().ok()?;
    // bounded walk in case of a cyclic Parent chain
    for _ in 0..64 {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_object(parent).ok()?.as_dict().ok()?;
    }
    None
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(v) => Some(*v as f64),
        Object::Real(v) => Some(*v as f64),
        _ => None,
    }
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object> {
    match obj {
        Object::Reference(id) => Ok(doc.get_object(*id)?),
        other => Ok(other),
    }
}

pub(crate) fn resolve_to_dict(doc: &Document, obj: &Object) -> Result<Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(d) => Ok(d.clone()),
        Object::Stream(s) => Ok(s.dict.clone()),
        other => Err(WatermarkError::EncodingFailure(format!(
            "expected a dictionary, found {other:?}"
        ))),
    }
}

/// The full-page raster of an image-only page (scans, "print to image").
pub fn extract_page_image(doc: &Document, page_id: ObjectId) -> Result<DynamicImage> {
    let resources = inherited(doc, page_id, b"Resources").ok_or_else(|| {
        WatermarkError::EncodingFailure("page has no resources".to_string())
    })?;
    let resources = resolve_to_dict(doc, resources)?;
    let xobjects = resources
        .get(b"XObject")
        .map_err(|_| WatermarkError::EncodingFailure("page has no image".to_string()))?;
    let xobjects = resolve_to_dict(doc, xobjects)?;

    for (_, obj_ref) in xobjects.iter() {
        let Object::Stream(stream) = resolve(doc, obj_ref)? else {
            continue;
        };
        let dict = &stream.dict;
        if !is_name(dict, b"Subtype", "Image") {
            continue;
        }
        let components = if is_name(dict, b"ColorSpace", "DeviceRGB") {
            3
        } else if is_name(dict, b"ColorSpace", "DeviceGray") {
            1
        } else {
            continue;
        };

        let width = get_uint(dict, b"Width")?;
        let height = get_uint(dict, b"Height")?;
        return decode_stream(stream, width, height, components);
    }

    Err(WatermarkError::EncodingFailure(
        "no RGB or gray image found on page".to_string(),
    ))
}

fn decode_stream(
    stream: &lopdf::Stream,
    w: u32,
    h: u32,
    components: u32,
) -> Result<DynamicImage> {
    let filter = stream
        .dict
        .get(b"Filter")
        .ok()
        .and_then(|f| f.as_name_str().ok())
        .unwrap_or("");

    let raw = match filter {
        "FlateDecode" => {
            let mut decoder = ZlibDecoder::new(&stream.content[..]);
            let mut data = Vec::new();
            decoder.read_to_end(&mut data)?;

            let stride = raster_len(w, 1, components, 0)?;
            if data.len() == raster_len(w, h, components, 1)? {
                remove_png_predictor(&data, stride, components as usize)
            } else {
                data
            }
        }
        "DCTDecode" => {
            let img = image::load(Cursor::new(&stream.content), image::ImageFormat::Jpeg)?;
            return Ok(img);
        }
        "" => stream.content.clone(),
        other => {
            return Err(WatermarkError::EncodingFailure(format!(
                "unsupported image filter {other}"
            )))
        }
    };

    let expected = raster_len(w, h, components, 0)?;
    if raw.len() != expected {
        return Err(WatermarkError::EncodingFailure(format!(
            "unexpected image size: {} bytes (expected {expected})",
            raw.len()
        )));
    }

    let invalid = || WatermarkError::EncodingFailure("invalid image data".to_string());
    if components == 1 {
        Ok(DynamicImage::ImageLuma8(
            GrayImage::from_raw(w, h, raw).ok_or_else(invalid)?,
        ))
    } else {
        Ok(DynamicImage::ImageRgb8(
            RgbImage::from_raw(w, h, raw).ok_or_else(invalid)?,
        ))
    }
}

/// Byte length of a `w`x`h` raster with `row_prefix` extra bytes per row.
fn raster_len(w: u32, h: u32, components: u32, row_prefix: usize) -> Result<usize> {
    (w as usize)
        .checked_mul(components as usize)
        .and_then(|stride| stride.checked_add(row_prefix))
        .and_then(|row| row.checked_mul(h as usize))
        .ok_or_else(|| WatermarkError::EncodingFailure(format!("{w}x{h} image is too large")))
}

fn is_name(dict: &Dictionary, key: &[u8], expected: &str) -> bool {
    dict.get(key)
        .ok()
        .and_then(|v| v.as_name_str().ok())
        .map(|s| s == expected)
        .unwrap_or(false)
}

fn get_uint(dict: &Dictionary, key: &[u8]) -> Result<u32> {
    let val = dict.get(key)?;
    val.as_i64()
        .ok()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            WatermarkError::EncodingFailure(format!(
                "expected a non-negative integer for {}",
                String::from_utf8_lossy(key)
            ))
        })
}

fn remove_png_predictor(data: &[u8], stride: usize, comp: usize) -> Vec<u8> {
    let row_len = stride + 1;
    let rows = data.len() / row_len;

    let mut result = Vec::with_capacity(stride * rows);
    let mut prev_row = vec![0u8; stride];

    for r in 0..rows {
        let row = &data[r * row_len..r * row_len + row_len];
        let filter = row[0];
        let raw = &row[1..];
        let mut decoded = vec![0u8; stride];

        match filter {
            1 => {
                for i in 0..stride {
                    let a = if i >= comp { decoded[i - comp] } else { 0 };
                    decoded[i] = raw[i].wrapping_add(a);
                }
            }
            2 => {
                for i in 0..stride {
                    decoded[i] = raw[i].wrapping_add(prev_row[i]);
                }
            }
            3 => {
                for i in 0..stride {
                    let a = if i >= comp { decoded[i - comp] as u16 } else { 0 };
                    let b = prev_row[i] as u16;
                    decoded[i] = raw[i].wrapping_add(((a + b) / 2) as u8);
                }
            }
            4 => {
                for i in 0..stride {
                    let a = if i >= comp { decoded[i - comp] } else { 0 };
                    let b = prev_row[i];
                    let c = if i >= comp { prev_row[i - comp] } else { 0 };
                    decoded[i] = raw[i].wrapping_add(paeth(a, b, c));
                }
            }
            _ => decoded.copy_from_slice(raw),
        }

        result.extend_from_slice(&decoded);
        prev_row = decoded;
    }

    result
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i32 + b as i32 - c as i32;
    let pa = (p - a as i32).abs();
    let pb = (p - b as i32).abs();
    let pc = (p - c as i32).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}
