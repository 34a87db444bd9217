//! Watermark style: what the label says and how it looks.
//!
//! A [`WatermarkStyle`] is an immutable value handed to the compositor on
//! every call. Several styles can coexist in one process.

use crate::error::{Result, WatermarkError};
use serde::{Deserialize, Serialize};

/// Opaque RGB color of the watermark glyphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Light gray used by the default DRAFT stamp.
    pub const fn light_gray() -> Self {
        Self::new(179, 179, 179)
    }

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl TryFrom<String> for Color {
    type Error = WatermarkError;

    fn try_from(value: String) -> Result<Self> {
        parse_hex_color(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_hex()
    }
}

/// Parse a hex color string, `#RGB` or `#RRGGBB`.
pub fn parse_hex_color(hex: &str) -> Result<Color> {
    let digits = hex
        .strip_prefix('#')
        .ok_or_else(|| WatermarkError::Config(format!("color must start with '#': {hex}")))?;
    if !digits.is_ascii() {
        return Err(WatermarkError::Config(format!("invalid hex digit in color {hex}")));
    }

    let channel = |s: &str| {
        u8::from_str_radix(s, 16)
            .map_err(|_| WatermarkError::Config(format!("invalid hex digit in color {hex}")))
    };

    match digits.len() {
        // each digit doubled: 0xA -> 0xAA
        3 => Ok(Color::new(
            channel(&digits[0..1])? * 17,
            channel(&digits[1..2])? * 17,
            channel(&digits[2..3])? * 17,
        )),
        6 => Ok(Color::new(
            channel(&digits[0..2])?,
            channel(&digits[2..4])?,
            channel(&digits[4..6])?,
        )),
        n => Err(WatermarkError::Config(format!(
            "color must be #RGB or #RRGGBB, got {n} digits"
        ))),
    }
}

/// Convert an opacity in `[0, 1]` to an 8-bit alpha.
pub fn alpha_from_opacity(opacity: f64) -> u8 {
    (opacity.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Where the overlay's bounding box is anchored on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorPolicy {
    /// Overlay centered on the page.
    #[default]
    Center,
    /// Overlay pushed into the page's visual bottom-left corner, inside the margin.
    BottomLeft,
}

impl std::str::FromStr for AnchorPolicy {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "center" => Ok(Self::Center),
            "bottom-left" => Ok(Self::BottomLeft),
            other => Err(WatermarkError::Config(format!(
                "anchor must be 'center' or 'bottom-left', got '{other}'"
            ))),
        }
    }
}

/// Full description of the stamp drawn on each page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkStyle {
    pub text: String,
    pub color: Color,
    /// Glyph alpha, 0 (invisible) to 255 (opaque).
    pub alpha: u8,
    /// Visual angle of the text baseline, counter-clockwise from horizontal.
    pub base_angle: i32,
    /// Font size as a fraction of the page diagonal, in `(0, 1]`.
    pub diagonal_fraction: f64,
    /// Margin kept free on each side, as a fraction of that axis, in `[0, 0.5)`.
    pub margin_fraction: f64,
    pub anchor: AnchorPolicy,
    /// Smallest font size ever used, in page units: points on PDF pages,
    /// pixels on images.
    pub min_font_size: u32,
    /// Extra shrink applied when the overlay must be scaled down to fit, in `(0, 1]`.
    pub safety_factor: f64,
    /// Transparent border around the text tile, as a fraction of the font size.
    pub padding_ratio: f64,
}

impl Default for WatermarkStyle {
    fn default() -> Self {
        Self {
            text: "DRAFT".to_string(),
            color: Color::light_gray(),
            alpha: alpha_from_opacity(0.12),
            base_angle: 45,
            diagonal_fraction: 0.18,
            margin_fraction: 0.05,
            anchor: AnchorPolicy::Center,
            min_font_size: 24,
            safety_factor: 0.97,
            padding_ratio: 0.3,
        }
    }
}

impl WatermarkStyle {
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(WatermarkError::Config(
                "watermark text must not be empty".to_string(),
            ));
        }
        if !(self.diagonal_fraction > 0.0 && self.diagonal_fraction <= 1.0) {
            return Err(WatermarkError::Config(format!(
                "diagonal_fraction must be in (0, 1], got {}",
                self.diagonal_fraction
            )));
        }
        if !(self.margin_fraction >= 0.0 && self.margin_fraction < 0.5) {
            return Err(WatermarkError::Config(format!(
                "margin_fraction must be in [0, 0.5), got {}",
                self.margin_fraction
            )));
        }
        if self.min_font_size == 0 {
            return Err(WatermarkError::Config(
                "min_font_size must be at least 1".to_string(),
            ));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(WatermarkError::Config(format!(
                "safety_factor must be in (0, 1], got {}",
                self.safety_factor
            )));
        }
        // below 0.3 the corners of a rotated tile can be cut off
        if !(0.3..=2.0).contains(&self.padding_ratio) {
            return Err(WatermarkError::Config(format!(
                "padding_ratio must be in [0.3, 2], got {}",
                self.padding_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("#FF0000", Color::new(255, 0, 0))]
    #[case("#00ff00", Color::new(0, 255, 0))]
    #[case("#B3B3B3", Color::light_gray())]
    #[case("#F00", Color::new(255, 0, 0))]
    #[case("#abc", Color::new(170, 187, 204))]
    fn test_parse_hex_color(#[case] input: &str, #[case] expected: Color) {
        assert_eq!(parse_hex_color(input).unwrap(), expected);
    }

    #[rstest]
    #[case("FF0000")]
    #[case("#FF00")]
    #[case("#FF00000")]
    #[case("#GGGGGG")]
    fn test_parse_hex_color_invalid(#[case] input: &str) {
        assert!(parse_hex_color(input).is_err());
    }

    #[test]
    fn test_default_style_matches_draft_stamp() {
        let style = WatermarkStyle::default();
        assert_eq!(style.text, "DRAFT");
        assert_eq!(style.alpha, 31);
        assert_eq!(style.base_angle, 45);
        assert_eq!(style.anchor, AnchorPolicy::Center);
        assert!(style.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_fractions() {
        let style = WatermarkStyle {
            diagonal_fraction: 0.0,
            ..Default::default()
        };
        assert!(style.validate().is_err());

        let style = WatermarkStyle {
            margin_fraction: 0.5,
            ..Default::default()
        };
        assert!(style.validate().is_err());

        let style = WatermarkStyle {
            text: "   ".to_string(),
            ..Default::default()
        };
        assert!(style.validate().is_err());
    }

    #[test]
    fn test_style_from_yaml_fills_defaults() {
        let yaml = "text: CONFIDENTIAL\ncolor: \"#C00\"\nanchor: bottom-left\n";
        let style: WatermarkStyle = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(style.text, "CONFIDENTIAL");
        assert_eq!(style.color, Color::new(204, 0, 0));
        assert_eq!(style.anchor, AnchorPolicy::BottomLeft);
        assert_eq!(style.diagonal_fraction, 0.18);
    }

    #[test]
    fn test_anchor_from_str() {
        assert_eq!("center".parse::<AnchorPolicy>().unwrap(), AnchorPolicy::Center);
        assert_eq!(
            "bottom-left".parse::<AnchorPolicy>().unwrap(),
            AnchorPolicy::BottomLeft
        );
        assert!("top".parse::<AnchorPolicy>().is_err());
    }

    #[test]
    fn test_alpha_from_opacity() {
        assert_eq!(alpha_from_opacity(0.0), 0);
        assert_eq!(alpha_from_opacity(1.0), 255);
        assert_eq!(alpha_from_opacity(2.0), 255);
        assert_eq!(alpha_from_opacity(0.12), 31);
    }
}
