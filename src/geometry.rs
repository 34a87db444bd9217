//! Page geometry and the placement math behind the compositor.
//!
//! All lengths here are canvas pixels with a top-left origin and y growing
//! downwards. Callers working in PDF points convert before calling in.
//!
//! Angles are counter-clockwise-positive as the viewer sees them. A page's
//! stored rotation turns the raw page box clockwise on display, so content
//! drawn at `base + rotation` on the raw box shows up at `base` on screen.

use crate::error::{Result, WatermarkError};
use crate::style::AnchorPolicy;

/// Raw bounding box of one page or image plus its declared display rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    width: f64,
    height: f64,
    rotation: u16,
}

impl PageGeometry {
    /// Build a geometry from the raw (unrotated) box and a rotation in degrees.
    ///
    /// Rotation is normalized modulo 360 and must be a multiple of 90.
    pub fn new(width: f64, height: f64, rotation: i64) -> Result<Self> {
        check_extent("width", width)?;
        check_extent("height", height)?;
        Ok(Self {
            width,
            height,
            rotation: normalize_rotation(rotation)?,
        })
    }

    /// Geometry of a standalone image, which never carries rotation metadata.
    pub fn image(width: u32, height: u32) -> Result<Self> {
        Self::new(width as f64, height as f64, 0)
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    /// Rotation in degrees, one of 0, 90, 180, 270.
    pub fn rotation(&self) -> u16 {
        self.rotation
    }

    pub fn diagonal(&self) -> f64 {
        self.width.hypot(self.height)
    }

    /// Pixel size of a transparent canvas covering the whole page.
    pub fn canvas_size(&self) -> (u32, u32) {
        (self.width.ceil() as u32, self.height.ceil() as u32)
    }
}

fn check_extent(axis: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(WatermarkError::InvalidGeometry(format!(
            "{axis} must be positive and finite, got {value}"
        )));
    }
    Ok(())
}

/// Normalize a rotation to one of 0, 90, 180, 270.
pub fn normalize_rotation(rotation: i64) -> Result<u16> {
    let normalized = rotation.rem_euclid(360);
    if normalized % 90 != 0 {
        return Err(WatermarkError::InvalidGeometry(format!(
            "rotation must be a multiple of 90, got {rotation}"
        )));
    }
    Ok(normalized as u16)
}

/// Angle actually applied to the text tile, in `[0, 360)`.
pub fn effective_angle(base_angle: i32, page_rotation: i64) -> i32 {
    (base_angle as i64 + page_rotation).rem_euclid(360) as i32
}

/// Font size derived from the page diagonal, never below `min_font_size`.
pub fn font_size_for(diagonal: f64, diagonal_fraction: f64, min_font_size: u32) -> u32 {
    let scaled = (diagonal * diagonal_fraction).floor();
    if scaled.is_finite() && scaled > min_font_size as f64 {
        scaled.min(u32::MAX as f64) as u32
    } else {
        min_font_size
    }
}

/// Top-left offset of the overlay on a page-sized canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
}

impl Placement {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Whole pixel columns `[x_min, x_max)` and rows `[y_min, y_max)` that lie
/// entirely inside the page margins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginBox {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl MarginBox {
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    /// Whether a `w x h` box placed at `placement` stays inside.
    pub fn contains(&self, placement: Placement, w: u32, h: u32) -> bool {
        placement.x >= self.x_min as i32
            && placement.y >= self.y_min as i32
            && placement.x as i64 + w as i64 <= self.x_max as i64
            && placement.y as i64 + h as i64 <= self.y_max as i64
    }
}

/// Margin in canvas units on each axis.
pub fn margins(page: &PageGeometry, margin_fraction: f64) -> (f64, f64) {
    (page.width * margin_fraction, page.height * margin_fraction)
}

/// Pixel region available to the overlay once margins are taken off.
///
/// Fractional margins are rounded inwards so that every pixel of the region
/// lies within `[margin, extent - margin]`.
pub fn margin_box(page: &PageGeometry, margin_fraction: f64) -> Result<MarginBox> {
    let (mx, my) = margins(page, margin_fraction);
    let x_min = mx.ceil();
    let x_max = (page.width - mx).floor();
    let y_min = my.ceil();
    let y_max = (page.height - my).floor();

    if x_max <= x_min || y_max <= y_min {
        return Err(WatermarkError::InvalidGeometry(format!(
            "{}x{} page leaves no room inside its margins",
            page.width, page.height
        )));
    }

    Ok(MarginBox {
        x_min: x_min as u32,
        x_max: x_max as u32,
        y_min: y_min as u32,
        y_max: y_max as u32,
    })
}

/// Downscale factor for a `w x h` overlay against `bounds`.
///
/// The factor is the fit ratio times `safety_factor`, capped at 1. `None`
/// means the overlay is used at its rendered size. The capped form keeps the
/// fitted size monotone in the rendered size.
pub fn fit_scale(w: u32, h: u32, bounds: &MarginBox, safety_factor: f64) -> Option<f64> {
    let fit_w = bounds.width() as f64 / w.max(1) as f64;
    let fit_h = bounds.height() as f64 / h.max(1) as f64;
    let scale = fit_w.min(fit_h) * safety_factor;
    if scale >= 1.0 {
        None
    } else {
        Some(scale)
    }
}

/// Size of a `w x h` overlay after scaling, floored and at least one pixel.
///
/// A tiny tolerance absorbs float noise so that `w * (b / w)` floors to `b`.
pub fn scaled_size(w: u32, h: u32, scale: f64) -> (u32, u32) {
    let axis = |v: u32| ((v as f64 * scale + 1e-9).floor().max(1.0) as u32).min(v);
    (axis(w), axis(h))
}

/// Where to put a `w x h` overlay on the page for the given anchor policy.
///
/// The overlay must already fit inside `bounds`; the result is clamped into
/// it so rounding can never push a pixel into the margin.
pub fn place(
    anchor: AnchorPolicy,
    page: &PageGeometry,
    bounds: &MarginBox,
    w: u32,
    h: u32,
) -> Placement {
    let left = bounds.x_min as i64;
    let top = bounds.y_min as i64;
    let right = bounds.x_max as i64 - w as i64;
    let bottom = bounds.y_max as i64 - h as i64;

    let (x, y) = match anchor {
        AnchorPolicy::Center => (
            ((page.width - w as f64) / 2.0).round() as i64,
            ((page.height - h as f64) / 2.0).round() as i64,
        ),
        // visual bottom-left expressed as a corner of the raw box
        AnchorPolicy::BottomLeft => match page.rotation {
            90 => (right, bottom),
            180 => (right, top),
            270 => (left, top),
            _ => (left, bottom),
        },
    };

    Placement::new(
        x.clamp(left, right.max(left)) as i32,
        y.clamp(top, bottom.max(top)) as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_rejects_degenerate_extents() {
        assert!(PageGeometry::new(0.0, 100.0, 0).is_err());
        assert!(PageGeometry::new(100.0, -1.0, 0).is_err());
        assert!(PageGeometry::new(f64::NAN, 100.0, 0).is_err());
        assert!(PageGeometry::new(100.0, f64::INFINITY, 0).is_err());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(90, 90)]
    #[case(360, 0)]
    #[case(450, 90)]
    #[case(-90, 270)]
    fn test_normalize_rotation(#[case] input: i64, #[case] expected: u16) {
        assert_eq!(normalize_rotation(input).unwrap(), expected);
    }

    #[test]
    fn test_normalize_rotation_rejects_oblique() {
        assert!(normalize_rotation(45).is_err());
        assert!(PageGeometry::new(100.0, 100.0, 30).is_err());
    }

    #[rstest]
    #[case(45, 0, 45)]
    #[case(45, 90, 135)]
    #[case(45, 270, 315)]
    #[case(45, 360, 45)]
    #[case(-45, 0, 315)]
    fn test_effective_angle(#[case] base: i32, #[case] rotation: i64, #[case] expected: i32) {
        assert_eq!(effective_angle(base, rotation), expected);
    }

    #[test]
    fn test_font_size_floor_on_tiny_page() {
        let page = PageGeometry::new(10.0, 10.0, 0).unwrap();
        assert_eq!(font_size_for(page.diagonal(), 0.18, 24), 24);
    }

    #[test]
    fn test_font_size_follows_diagonal() {
        // A4 portrait in points: diagonal ~1031.0
        let page = PageGeometry::new(595.0, 842.0, 0).unwrap();
        assert_eq!(font_size_for(page.diagonal(), 0.18, 24), 185);
    }

    #[test]
    fn test_margin_box_rounds_inwards() {
        let page = PageGeometry::new(101.0, 51.0, 0).unwrap();
        let bounds = margin_box(&page, 0.05).unwrap();
        // margins 5.05 / 2.55
        assert_eq!(bounds.x_min, 6);
        assert_eq!(bounds.x_max, 95);
        assert_eq!(bounds.y_min, 3);
        assert_eq!(bounds.y_max, 48);
    }

    #[test]
    fn test_margin_box_too_small() {
        let page = PageGeometry::new(0.5, 0.5, 0).unwrap();
        assert!(margin_box(&page, 0.0).is_err());
    }

    #[test]
    fn test_fit_scale_only_when_needed() {
        let bounds = MarginBox {
            x_min: 10,
            x_max: 110,
            y_min: 10,
            y_max: 60,
        };
        assert_eq!(fit_scale(90, 40, &bounds, 0.97), None);
        let scale = fit_scale(200, 50, &bounds, 0.97).unwrap();
        assert!((scale - 0.485).abs() < 1e-9);
        assert_eq!(scaled_size(200, 50, scale), (97, 24));
    }

    #[test]
    fn test_fit_scale_applies_safety_near_the_boundary() {
        let bounds = MarginBox {
            x_min: 0,
            x_max: 100,
            y_min: 0,
            y_max: 100,
        };
        // fits exactly, but the safety margin still shrinks it
        let scale = fit_scale(100, 100, &bounds, 0.97).unwrap();
        assert_eq!(scaled_size(100, 100, scale), (97, 97));
        // a slightly smaller overlay must not come out larger
        assert_eq!(fit_scale(96, 96, &bounds, 0.97), None);
        let scale = fit_scale(98, 98, &bounds, 0.97).unwrap();
        assert_eq!(scaled_size(98, 98, scale), (97, 97));
    }

    #[test]
    fn test_fitted_size_is_monotone_in_rendered_size() {
        let bounds = MarginBox {
            x_min: 20,
            x_max: 380,
            y_min: 15,
            y_max: 285,
        };
        let fitted = |side: u32| match fit_scale(side, side, &bounds, 0.97) {
            Some(scale) => scaled_size(side, side, scale),
            None => (side, side),
        };
        let mut previous = fitted(1);
        for side in 2..2000 {
            let current = fitted(side);
            assert!(current.0 >= previous.0 && current.1 >= previous.1, "side {side}");
            previous = current;
        }
        assert_eq!(previous, (261, 261));
    }

    #[rstest]
    #[case(1.0)]
    #[case(2.0)]
    fn test_tiny_images_have_no_room_inside_margins(#[case] side: f64) {
        let page = PageGeometry::new(side, side, 0).unwrap();
        assert!(matches!(
            margin_box(&page, 0.05),
            Err(WatermarkError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_three_pixel_image_keeps_one_pixel() {
        let page = PageGeometry::new(3.0, 3.0, 0).unwrap();
        let bounds = margin_box(&page, 0.05).unwrap();
        assert_eq!((bounds.width(), bounds.height()), (1, 1));
    }

    #[test]
    fn test_center_placement() {
        let page = PageGeometry::new(800.0, 600.0, 0).unwrap();
        let bounds = margin_box(&page, 0.05).unwrap();
        let p = place(AnchorPolicy::Center, &page, &bounds, 100, 50);
        assert_eq!(p, Placement::new(350, 275));
    }

    #[rstest]
    #[case(0, Placement::new(40, 490))]
    #[case(90, Placement::new(660, 490))]
    #[case(180, Placement::new(660, 30))]
    #[case(270, Placement::new(40, 30))]
    fn test_bottom_left_follows_visual_corner(#[case] rotation: i64, #[case] expected: Placement) {
        let page = PageGeometry::new(800.0, 600.0, rotation).unwrap();
        let bounds = margin_box(&page, 0.05).unwrap();
        let p = place(AnchorPolicy::BottomLeft, &page, &bounds, 100, 80);
        assert_eq!(p, expected);
        assert!(bounds.contains(p, 100, 80));
    }
}
