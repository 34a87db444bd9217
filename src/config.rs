//! YAML configuration for the command-line tool.
//!
//! Every field has a default, so an empty document (or no file at all) is a
//! valid configuration.

use crate::batch::{BatchOptions, DEFAULT_ARCHIVE_NAME, DEFAULT_OUTPUT_SUFFIX, MAX_BATCH_ITEMS};
use crate::builder::{parse_quality, strategies, PdfOptions};
use crate::error::{Result, WatermarkError};
use crate::font::FontSource;
use crate::style::WatermarkStyle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub style: WatermarkStyle,
    /// Font files tried in order before the built-in font.
    #[serde(default)]
    pub fonts: Vec<PathBuf>,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_pixels_per_point() -> f64 {
    2.0
}

fn default_max_overlay_side() -> u32 {
    4096
}

fn default_quality() -> String {
    "lossless".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfConfig {
    #[serde(default = "default_pixels_per_point")]
    pub pixels_per_point: f64,
    #[serde(default = "default_max_overlay_side")]
    pub max_overlay_side: u32,
    /// Rebuild image-only documents from stamped page rasters.
    #[serde(default)]
    pub flatten: bool,
    /// `lossless` or a JPEG quality from 1 to 100.
    #[serde(default = "default_quality")]
    pub quality: String,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            pixels_per_point: default_pixels_per_point(),
            max_overlay_side: default_max_overlay_side(),
            flatten: false,
            quality: default_quality(),
        }
    }
}

fn default_max_items() -> usize {
    MAX_BATCH_ITEMS
}

fn default_output_suffix() -> String {
    DEFAULT_OUTPUT_SUFFIX.to_string()
}

fn default_archive_name() -> String {
    DEFAULT_ARCHIVE_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            output_suffix: default_output_suffix(),
            archive_name: default_archive_name(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| WatermarkError::Config(e.to_string()))
    }

    /// Read and validate a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            WatermarkError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.style.validate()?;
        parse_quality(&self.pdf.quality)?;

        if !(self.pdf.pixels_per_point.is_finite() && self.pdf.pixels_per_point > 0.0) {
            return Err(WatermarkError::Config(format!(
                "pdf.pixels_per_point must be positive, got {}",
                self.pdf.pixels_per_point
            )));
        }
        if self.pdf.max_overlay_side == 0 {
            return Err(WatermarkError::Config(
                "pdf.max_overlay_side must be at least 1".to_string(),
            ));
        }
        if self.batch.max_items == 0 {
            return Err(WatermarkError::Config(
                "batch.max_items must be at least 1".to_string(),
            ));
        }
        if self.batch.archive_name.trim().is_empty() {
            return Err(WatermarkError::Config(
                "batch.archive_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured font files followed by the built-in font.
    pub fn font_sources(&self) -> Vec<FontSource> {
        self.fonts
            .iter()
            .cloned()
            .map(FontSource::File)
            .chain(std::iter::once(FontSource::Builtin))
            .collect()
    }

    pub fn pdf_options(&self) -> Result<PdfOptions> {
        Ok(PdfOptions {
            pixels_per_point: self.pdf.pixels_per_point,
            max_overlay_side: self.pdf.max_overlay_side,
            quality: parse_quality(&self.pdf.quality)?,
            strategies: strategies(self.pdf.flatten),
        })
    }

    pub fn batch_options(&self) -> Result<BatchOptions> {
        Ok(BatchOptions {
            max_items: self.batch.max_items,
            output_suffix: self.batch.output_suffix.clone(),
            pdf: self.pdf_options()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{EncodeStrategy, Quality};
    use crate::style::AnchorPolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(AppConfig::from_yaml("").unwrap(), AppConfig::default());
        assert_eq!(AppConfig::from_yaml("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r##"
style:
  text: CONFIDENTIAL
  color: "#c00"
  anchor: bottom-left
pdf:
  flatten: true
  quality: "80"
batch:
  max_items: 10
"##;
        let config = AppConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.style.text, "CONFIDENTIAL");
        assert_eq!(config.style.color.to_hex(), "#CC0000");
        assert_eq!(config.style.anchor, AnchorPolicy::BottomLeft);
        assert_eq!(config.style.base_angle, 45);
        assert_eq!(config.batch.output_suffix, "_DRAFT");

        let options = config.batch_options().unwrap();
        assert_eq!(options.max_items, 10);
        assert_eq!(options.pdf.quality, Quality::Jpeg(80));
        assert_eq!(options.pdf.strategies[0], EncodeStrategy::Rasterize);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.batch.max_items = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pdf.quality = "best".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pdf.pixels_per_point = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_type_is_config_error() {
        let err = AppConfig::from_yaml("pdf:\n  flatten: maybe\n").unwrap_err();
        assert!(matches!(err, WatermarkError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "style:\n  base_angle: 30\nfonts:\n  - /nonexistent/font.ttf").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.style.base_angle, 30);

        let sources = config.font_sources();
        assert_eq!(sources.len(), 2);
        assert!(matches!(sources[1], FontSource::Builtin));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, WatermarkError::Config(_)));
    }
}
