//! The watermark compositor.
//!
//! [`Compositor::build`] turns a page geometry and a style into a rotated,
//! scaled, translucent label bitmap plus the offset at which it goes on a
//! page-sized canvas. [`composite`] then blends that overlay onto pixels.
//!
//! Building an overlay is pure: no shared state, no I/O, identical inputs
//! give bit-identical outputs, so pages can be processed in parallel.

use crate::error::Result;
use crate::font::{BlockFont, TextRenderer};
use crate::geometry::{
    effective_angle, fit_scale, font_size_for, margin_box, place, scaled_size, PageGeometry,
    Placement,
};
use crate::style::WatermarkStyle;
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgba, RgbaImage};
use std::sync::Arc;
use tracing::debug;

/// A rendered watermark ready to be composited onto one page.
#[derive(Clone)]
pub struct Overlay {
    /// Rotated label, sized to its own bounding box.
    pub bitmap: RgbaImage,
    /// Top-left offset of `bitmap` on the page canvas.
    pub placement: Placement,
    /// Counter-clockwise angle applied to the text, in `[0, 360)`.
    pub effective_angle: i32,
    pub font_size: u32,
    /// Downscale applied to fit the margins, 1.0 when none was needed.
    pub scale: f64,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("dimensions", &self.bitmap.dimensions())
            .field("placement", &self.placement)
            .field("effective_angle", &self.effective_angle)
            .field("font_size", &self.font_size)
            .field("scale", &self.scale)
            .finish()
    }
}

/// Builds watermark overlays with an injected text renderer.
#[derive(Clone)]
pub struct Compositor {
    renderer: Arc<dyn TextRenderer>,
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("renderer", &self.renderer.name())
            .finish()
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(Arc::new(BlockFont))
    }
}

impl Compositor {
    pub fn new(renderer: Arc<dyn TextRenderer>) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &dyn TextRenderer {
        self.renderer.as_ref()
    }

    /// Compute the overlay for one page.
    ///
    /// The returned bitmap always fits inside the page margins at the
    /// returned placement, whatever the page size or stored rotation.
    pub fn build(&self, page: &PageGeometry, style: &WatermarkStyle) -> Result<Overlay> {
        style.validate()?;
        let bounds = margin_box(page, style.margin_fraction)?;

        let font_size =
            font_size_for(page.diagonal(), style.diagonal_fraction, style.min_font_size);
        let tile = self.render_tile(style, font_size);

        let angle = effective_angle(style.base_angle, page.rotation() as i64);
        let rotated = rotate_expanded(&tile, angle);

        let (bitmap, scale) =
            match fit_scale(rotated.width(), rotated.height(), &bounds, style.safety_factor) {
                Some(scale) => {
                    let (w, h) = scaled_size(rotated.width(), rotated.height(), scale);
                    (imageops::resize(&rotated, w, h, FilterType::Lanczos3), scale)
                }
                None => (rotated, 1.0),
            };

        let placement = place(style.anchor, page, &bounds, bitmap.width(), bitmap.height());

        debug!(
            width = page.width(),
            height = page.height(),
            rotation = page.rotation(),
            font_size,
            angle,
            scale,
            x = placement.x,
            y = placement.y,
            "Built watermark overlay"
        );

        Ok(Overlay {
            bitmap,
            placement,
            effective_angle: angle,
            font_size,
            scale,
        })
    }

    /// Build the overlay for `canvas` and blend it in place.
    pub fn stamp(
        &self,
        canvas: &mut RgbaImage,
        rotation: i64,
        style: &WatermarkStyle,
    ) -> Result<Overlay> {
        let page = PageGeometry::new(canvas.width() as f64, canvas.height() as f64, rotation)?;
        let overlay = self.build(&page, style)?;
        composite(canvas, &overlay);
        Ok(overlay)
    }

    /// Unrotated label tile: the text in the style color with a transparent
    /// padding border wide enough that rotation never clips a corner.
    fn render_tile(&self, style: &WatermarkStyle, font_size: u32) -> RgbaImage {
        let size = font_size as f32;
        let (text_w, text_h) = self.renderer.measure(&style.text, size);
        let pad = (font_size as f64 * style.padding_ratio).ceil() as u32;

        let mut coverage = GrayImage::new(text_w + 2 * pad, text_h + 2 * pad);
        self.renderer.draw(&style.text, size, &mut coverage, pad, pad);

        let color = style.color;
        let alpha = style.alpha as u32;
        RgbaImage::from_fn(coverage.width(), coverage.height(), |x, y| {
            let c = coverage.get_pixel(x, y).0[0] as u32;
            let a = ((c * alpha + 127) / 255) as u8;
            Rgba([color.r, color.g, color.b, a])
        })
    }
}

/// Rotate `image` counter-clockwise by `degrees`, growing the canvas so
/// nothing is cropped.
///
/// Right angles are exact pixel permutations; other angles are resampled
/// bilinearly on premultiplied alpha.
pub fn rotate_expanded(image: &RgbaImage, degrees: i32) -> RgbaImage {
    match degrees.rem_euclid(360) {
        0 => return image.clone(),
        // imageops rotates clockwise
        90 => return imageops::rotate270(image),
        180 => return imageops::rotate180(image),
        270 => return imageops::rotate90(image),
        _ => {}
    }

    let (sin, cos) = (degrees as f64).to_radians().sin_cos();
    let src_w = image.width() as f64;
    let src_h = image.height() as f64;

    let dst_w = (src_w * cos.abs() + src_h * sin.abs()).ceil().max(1.0) as u32;
    let dst_h = (src_w * sin.abs() + src_h * cos.abs()).ceil().max(1.0) as u32;

    let src_cx = src_w / 2.0;
    let src_cy = src_h / 2.0;
    let dst_cx = dst_w as f64 / 2.0;
    let dst_cy = dst_h as f64 / 2.0;

    RgbaImage::from_fn(dst_w, dst_h, |dx, dy| {
        let rx = dx as f64 + 0.5 - dst_cx;
        let ry = dy as f64 + 0.5 - dst_cy;
        // inverse of a counter-clockwise turn with y pointing down
        let sx = rx * cos - ry * sin + src_cx - 0.5;
        let sy = rx * sin + ry * cos + src_cy - 0.5;
        sample_bilinear(image, sx, sy)
    })
}

fn sample_bilinear(image: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (w, h) = (image.width() as i64, image.height() as i64);

    let taps = [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ];

    let mut acc = [0.0f64; 4];
    for (ox, oy, weight) in taps {
        let px = x0 as i64 + ox;
        let py = y0 as i64 + oy;
        if weight <= 0.0 || px < 0 || py < 0 || px >= w || py >= h {
            continue;
        }
        let p = image.get_pixel(px as u32, py as u32);
        let a = p[3] as f64 * weight;
        acc[0] += p[0] as f64 * a;
        acc[1] += p[1] as f64 * a;
        acc[2] += p[2] as f64 * a;
        acc[3] += a;
    }

    if acc[3] < 0.5 {
        return Rgba([0, 0, 0, 0]);
    }
    let channel = |v: f64| (v / acc[3]).round().clamp(0.0, 255.0) as u8;
    Rgba([
        channel(acc[0]),
        channel(acc[1]),
        channel(acc[2]),
        acc[3].round().clamp(0.0, 255.0) as u8,
    ])
}

/// Blend `overlay` onto `canvas` at its placement with the "over" operator.
///
/// Only pixels under the overlay are touched; everything else is left as is.
pub fn composite(canvas: &mut RgbaImage, overlay: &Overlay) {
    let cw = canvas.width() as i64;
    let ch = canvas.height() as i64;
    let ox = overlay.placement.x as i64;
    let oy = overlay.placement.y as i64;

    let x_start = ox.max(0);
    let y_start = oy.max(0);
    let x_end = (ox + overlay.bitmap.width() as i64).min(cw);
    let y_end = (oy + overlay.bitmap.height() as i64).min(ch);

    for ty in y_start..y_end {
        for tx in x_start..x_end {
            let fg = *overlay.bitmap.get_pixel((tx - ox) as u32, (ty - oy) as u32);
            if fg[3] == 0 {
                continue;
            }
            let target = canvas.get_pixel_mut(tx as u32, ty as u32);
            *target = blend_pixels(*target, fg);
        }
    }
}

/// Porter-Duff "over": result = foreground + background * (1 - foreground.alpha)
fn blend_pixels(background: Rgba<u8>, foreground: Rgba<u8>) -> Rgba<u8> {
    let fg_alpha = foreground[3] as f32 / 255.0;
    let bg_alpha = background[3] as f32 / 255.0;
    let out_alpha = fg_alpha + bg_alpha * (1.0 - fg_alpha);

    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let blend_channel = |fg: u8, bg: u8| -> u8 {
        let fg = fg as f32 / 255.0;
        let bg = bg as f32 / 255.0;
        let result = (fg * fg_alpha + bg * bg_alpha * (1.0 - fg_alpha)) / out_alpha;
        (result * 255.0).round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        blend_channel(foreground[0], background[0]),
        blend_channel(foreground[1], background[1]),
        blend_channel(foreground[2], background[2]),
        (out_alpha * 255.0).round() as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::margins;
    use crate::style::{AnchorPolicy, Color};

    fn opaque_style() -> WatermarkStyle {
        WatermarkStyle {
            alpha: 255,
            color: Color::new(200, 0, 0),
            ..Default::default()
        }
    }

    fn ink(bitmap: &RgbaImage) -> Vec<(f64, f64)> {
        bitmap
            .enumerate_pixels()
            .filter(|(_, _, p)| p[3] > 0)
            .map(|(x, y, _)| (x as f64, y as f64))
            .collect()
    }

    /// Covariance of ink x against ink y; negative means the text climbs to
    /// the right on a y-down canvas.
    fn ink_slope_sign(bitmap: &RgbaImage) -> f64 {
        let points = ink(bitmap);
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum::<f64>()
            / n
    }

    #[test]
    fn test_overlay_ascends_left_to_right_on_unrotated_page() {
        let page = PageGeometry::new(612.0, 792.0, 0).unwrap();
        let overlay = Compositor::default().build(&page, &opaque_style()).unwrap();
        assert_eq!(overlay.effective_angle, 45);
        assert!(ink_slope_sign(&overlay.bitmap) < 0.0);
    }

    #[test]
    fn test_rotated_page_compensates_angle() {
        let page = PageGeometry::new(612.0, 792.0, 90).unwrap();
        let overlay = Compositor::default().build(&page, &opaque_style()).unwrap();
        assert_eq!(overlay.effective_angle, 135);
        // on the raw box the text descends; turned 90 degrees clockwise for
        // display it climbs again
        assert!(ink_slope_sign(&overlay.bitmap) > 0.0);
    }

    #[test]
    fn test_invalid_geometry_fails_fast() {
        assert!(PageGeometry::new(0.0, 100.0, 0).is_err());
        let page = PageGeometry::new(0.4, 0.4, 0).unwrap();
        let err = Compositor::default()
            .build(&page, &WatermarkStyle::default())
            .unwrap_err();
        assert!(matches!(err, crate::WatermarkError::InvalidGeometry(_)));
    }

    #[test]
    fn test_tiny_page_uses_minimum_font_size() {
        let page = PageGeometry::new(10.0, 10.0, 0).unwrap();
        let overlay = Compositor::default()
            .build(&page, &WatermarkStyle::default())
            .unwrap();
        assert_eq!(overlay.font_size, 24);
        assert!(overlay.scale < 1.0);
        let bounds = margin_box(&page, 0.05).unwrap();
        assert!(bounds.contains(
            overlay.placement,
            overlay.bitmap.width(),
            overlay.bitmap.height()
        ));
    }

    #[test]
    fn test_build_is_deterministic() {
        let page = PageGeometry::new(595.0, 842.0, 270).unwrap();
        let compositor = Compositor::default();
        let style = WatermarkStyle::default();
        let a = compositor.build(&page, &style).unwrap();
        let b = compositor.build(&page, &style).unwrap();
        assert_eq!(a.placement, b.placement);
        assert_eq!(a.bitmap.as_raw(), b.bitmap.as_raw());
    }

    #[test]
    fn test_center_anchor_centers_overlay() {
        let page = PageGeometry::new(1000.0, 1000.0, 0).unwrap();
        let overlay = Compositor::default()
            .build(&page, &WatermarkStyle::default())
            .unwrap();
        let cx = overlay.placement.x as f64 + overlay.bitmap.width() as f64 / 2.0;
        let cy = overlay.placement.y as f64 + overlay.bitmap.height() as f64 / 2.0;
        assert!((cx - 500.0).abs() <= 1.0);
        assert!((cy - 500.0).abs() <= 1.0);
    }

    #[test]
    fn test_bottom_left_anchor_touches_margin_corner() {
        let page = PageGeometry::new(1000.0, 800.0, 0).unwrap();
        let style = WatermarkStyle {
            anchor: AnchorPolicy::BottomLeft,
            diagonal_fraction: 0.05,
            ..Default::default()
        };
        let overlay = Compositor::default().build(&page, &style).unwrap();
        assert_eq!(overlay.placement.x, 50);
        assert_eq!(
            overlay.placement.y + overlay.bitmap.height() as i32,
            760
        );
    }

    #[test]
    fn test_rotate_right_angles_are_exact() {
        let mut image = RgbaImage::new(3, 2);
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let rotated = rotate_expanded(&image, 90);
        assert_eq!(rotated.dimensions(), (2, 3));
        // top-left corner turns counter-clockwise into the bottom-left
        assert_eq!(rotated.get_pixel(0, 2), &Rgba([255, 0, 0, 255]));
        assert_eq!(rotate_expanded(&image, 360).as_raw(), image.as_raw());
    }

    #[test]
    fn test_rotate_expands_canvas() {
        let image = RgbaImage::from_pixel(100, 20, Rgba([0, 0, 0, 255]));
        let rotated = rotate_expanded(&image, 45);
        assert!(rotated.width() >= 84 && rotated.height() >= 84);
        // the center stays fully inked
        let center = rotated.get_pixel(rotated.width() / 2, rotated.height() / 2);
        assert_eq!(center[3], 255);
    }

    #[test]
    fn test_composite_only_touches_overlay_area() {
        let mut canvas = RgbaImage::from_pixel(200, 200, Rgba([10, 20, 30, 255]));
        let original = canvas.clone();
        let page = PageGeometry::image(200, 200).unwrap();
        let overlay = Compositor::default()
            .build(&page, &opaque_style())
            .unwrap();
        composite(&mut canvas, &overlay);

        let (x0, y0) = (overlay.placement.x as u32, overlay.placement.y as u32);
        let (w, h) = overlay.bitmap.dimensions();
        let mut changed = 0;
        for (x, y, p) in canvas.enumerate_pixels() {
            let inside = x >= x0 && x < x0 + w && y >= y0 && y < y0 + h;
            if !inside {
                assert_eq!(p, original.get_pixel(x, y));
            } else if p != original.get_pixel(x, y) {
                changed += 1;
            }
        }
        assert!(changed > 0);
    }

    #[test]
    fn test_blend_over_opaque_background() {
        let bg = Rgba([0, 0, 0, 255]);
        assert_eq!(blend_pixels(bg, Rgba([255, 255, 255, 0])), bg);
        assert_eq!(
            blend_pixels(bg, Rgba([255, 255, 255, 255])),
            Rgba([255, 255, 255, 255])
        );
        let half = blend_pixels(bg, Rgba([200, 200, 200, 128]));
        assert_eq!(half[3], 255);
        assert!(half[0] > 90 && half[0] < 110);
    }

    #[test]
    fn test_composite_on_transparent_page_stays_inside_margins() {
        let page = PageGeometry::new(300.5, 200.2, 0).unwrap();
        let overlay = Compositor::default()
            .build(&page, &WatermarkStyle::default())
            .unwrap();
        let (w, h) = page.canvas_size();
        assert_eq!((w, h), (301, 201));

        let mut canvas = RgbaImage::new(w, h);
        composite(&mut canvas, &overlay);
        let (mx, my) = margins(&page, 0.05);
        let mut inked = 0;
        for (x, y, p) in canvas.enumerate_pixels() {
            if p[3] > 0 {
                inked += 1;
                assert!(x as f64 >= mx && x as f64 + 1.0 <= page.width() - mx);
                assert!(y as f64 >= my && y as f64 + 1.0 <= page.height() - my);
            }
        }
        assert!(inked > 0);
    }

    #[test]
    fn test_overlay_area_never_shrinks_as_fraction_grows() {
        let page = PageGeometry::new(400.0, 300.0, 0).unwrap();
        let compositor = Compositor::default();
        let mut previous = 0u64;
        // crosses the point where the overlay first needs shrinking
        for step in 5..=40 {
            let style = WatermarkStyle {
                diagonal_fraction: step as f64 / 100.0,
                ..Default::default()
            };
            let overlay = compositor.build(&page, &style).unwrap();
            let area = overlay.bitmap.width() as u64 * overlay.bitmap.height() as u64;
            assert!(area >= previous, "fraction {}: {area} < {previous}", style.diagonal_fraction);
            previous = area;
        }
        assert_eq!(previous, 261 * 261);
    }
}
