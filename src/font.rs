//! Text rendering capability used by the compositor.
//!
//! The compositor only needs something that can measure a string at a given
//! pixel size and draw its coverage into a grayscale tile. Two renderers are
//! provided:
//!
//! - [`TrueTypeRenderer`]: any TrueType/OpenType font, rasterized with ab_glyph
//! - [`BlockFont`]: a built-in 5x7 block face, always available
//!
//! Which one is used is decided by [`resolve_renderer`] from an ordered list
//! of [`FontSource`]s, so nothing here depends on filesystem layout.

use crate::error::{Result, WatermarkError};
use ab_glyph::{point, Font, FontVec, GlyphId, PxScale, ScaleFont};
use image::{GrayImage, Luma};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Something that can measure and draw a line of text at a given size.
pub trait TextRenderer: Send + Sync {
    /// Short description for logs.
    fn name(&self) -> &str;

    /// Width and height, in pixels, of `text` laid out on one line.
    fn measure(&self, text: &str, font_size: f32) -> (u32, u32);

    /// Draw the coverage of `text` into `canvas` with its measured box at
    /// `(x, y)`. Coverage is written as 0..=255; glyph parts falling outside
    /// the canvas are dropped.
    fn draw(&self, text: &str, font_size: f32, canvas: &mut GrayImage, x: u32, y: u32);
}

/// TrueType/OpenType font loaded into memory.
pub struct TrueTypeRenderer {
    font: FontVec,
    name: String,
}

impl TrueTypeRenderer {
    pub fn from_bytes(data: Vec<u8>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let font = FontVec::try_from_vec(data)
            .map_err(|e| WatermarkError::Render(format!("{name}: {e}")))?;
        Ok(Self { font, name })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data, path.display().to_string())
    }

    /// Glyph ids of `text` with the pen advance before each one.
    fn layout(&self, text: &str, scale: PxScale) -> (Vec<(GlyphId, f32)>, f32) {
        let scaled = self.font.as_scaled(scale);
        let mut glyphs = Vec::with_capacity(text.len());
        let mut cursor = 0.0f32;
        let mut prev: Option<GlyphId> = None;

        for c in text.chars() {
            let id = scaled.glyph_id(c);
            if let Some(prev) = prev {
                cursor += scaled.kern(prev, id);
            }
            glyphs.push((id, cursor));
            cursor += scaled.h_advance(id);
            prev = Some(id);
        }

        (glyphs, cursor)
    }
}

impl TextRenderer for TrueTypeRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    fn measure(&self, text: &str, font_size: f32) -> (u32, u32) {
        let scale = PxScale::from(font_size);
        let scaled = self.font.as_scaled(scale);
        let (_, width) = self.layout(text, scale);
        let height = scaled.ascent() - scaled.descent();
        (width.ceil().max(1.0) as u32, height.ceil().max(1.0) as u32)
    }

    fn draw(&self, text: &str, font_size: f32, canvas: &mut GrayImage, x: u32, y: u32) {
        let scale = PxScale::from(font_size);
        let baseline = y as f32 + self.font.as_scaled(scale).ascent();
        let (glyphs, _) = self.layout(text, scale);
        let (cw, ch) = canvas.dimensions();

        for (id, advance) in glyphs {
            let glyph = id.with_scale_and_position(scale, point(x as f32 + advance, baseline));
            let Some(outlined) = self.font.outline_glyph(glyph) else {
                continue;
            };
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                let px = gx as i64 + bounds.min.x as i64;
                let py = gy as i64 + bounds.min.y as i64;
                if px < 0 || py < 0 || px >= cw as i64 || py >= ch as i64 {
                    return;
                }
                let value = (coverage.clamp(0.0, 1.0) * 255.0).round() as u8;
                let pixel = canvas.get_pixel_mut(px as u32, py as u32);
                // overlapping glyph edges keep the stronger coverage
                pixel.0[0] = pixel.0[0].max(value);
            });
        }
    }
}

/// Built-in 5x7 block face covering A-Z, 0-9 and a little punctuation.
///
/// Lowercase letters are drawn as capitals; anything else falls back to `?`.
/// One cell is 6 units wide (5 + 1 spacing), the line is 8 units tall, and a
/// unit is `font_size / 8` pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockFont;

/// Name reported by [`BlockFont`].
pub const BUILTIN_FONT_NAME: &str = "built-in block font";

const BLOCK_COLUMNS: u32 = 5;
const BLOCK_ROWS: usize = 7;
const BLOCK_ADVANCE: u32 = 6;
const BLOCK_LINE: u32 = 8;

impl BlockFont {
    fn unit(font_size: f32) -> f32 {
        font_size / BLOCK_LINE as f32
    }

    fn glyph(c: char) -> [u8; BLOCK_ROWS] {
        match c.to_ascii_uppercase() {
            'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
            'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
            'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
            'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
            'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
            'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
            'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
            'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
            'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
            'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
            'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
            'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
            'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
            'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
            'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
            'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
            'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
            'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
            'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
            'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
            'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
            'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
            'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
            'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
            'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
            'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
            '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
            '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
            '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
            '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
            '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
            '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
            '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
            '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
            '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
            '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
            ' ' => [0; 7],
            '-' => [0, 0, 0, 0b11111, 0, 0, 0],
            '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
            '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0, 0b00100],
            _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
        }
    }
}

impl TextRenderer for BlockFont {
    fn name(&self) -> &str {
        BUILTIN_FONT_NAME
    }

    fn measure(&self, text: &str, font_size: f32) -> (u32, u32) {
        let unit = Self::unit(font_size);
        let cells = text.chars().count() as u32;
        let width_units = (cells * BLOCK_ADVANCE).saturating_sub(1);
        (
            (width_units as f32 * unit).ceil().max(1.0) as u32,
            (BLOCK_LINE as f32 * unit).ceil().max(1.0) as u32,
        )
    }

    fn draw(&self, text: &str, font_size: f32, canvas: &mut GrayImage, x: u32, y: u32) {
        let unit = Self::unit(font_size);
        let (cw, ch) = canvas.dimensions();

        for (index, c) in text.chars().enumerate() {
            let rows = Self::glyph(c);
            let cell_x = x as f32 + (index as u32 * BLOCK_ADVANCE) as f32 * unit;

            for (row, bits) in rows.iter().enumerate() {
                for col in 0..BLOCK_COLUMNS {
                    if bits & (1 << (BLOCK_COLUMNS - 1 - col)) == 0 {
                        continue;
                    }
                    let x0 = (cell_x + col as f32 * unit).round() as u32;
                    let x1 = (cell_x + (col + 1) as f32 * unit).round() as u32;
                    let y0 = (y as f32 + row as f32 * unit).round() as u32;
                    let y1 = (y as f32 + (row + 1) as f32 * unit).round() as u32;

                    for py in y0..y1.min(ch) {
                        for px in x0..x1.min(cw) {
                            canvas.put_pixel(px, py, Luma([255]));
                        }
                    }
                }
            }
        }
    }
}

/// Where a font may come from, tried in order by [`resolve_renderer`].
#[derive(Clone)]
pub enum FontSource {
    File(PathBuf),
    Bytes { name: String, data: Vec<u8> },
    Builtin,
}

impl FontSource {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Bytes { name, .. } => name.clone(),
            Self::Builtin => "builtin".to_string(),
        }
    }

    fn load(&self) -> Result<Arc<dyn TextRenderer>> {
        match self {
            Self::File(path) => Ok(Arc::new(TrueTypeRenderer::from_file(path)?)),
            Self::Bytes { name, data } => {
                Ok(Arc::new(TrueTypeRenderer::from_bytes(data.clone(), name.clone())?))
            }
            Self::Builtin => Ok(Arc::new(BlockFont)),
        }
    }
}

/// Pick the first usable font from `sources`.
///
/// Sources that cannot be read or parsed are logged and skipped; the
/// built-in block font is used when none of them loads.
pub fn resolve_renderer(sources: &[FontSource]) -> Arc<dyn TextRenderer> {
    for source in sources {
        match source.load() {
            Ok(renderer) => {
                debug!(font = renderer.name(), "Resolved watermark font");
                return renderer;
            }
            Err(e) => {
                warn!(source = %source.describe(), error = %e, "Skipping unusable font source")
            }
        }
    }
    Arc::new(BlockFont)
}
