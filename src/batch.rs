//! Batch processing of named in-memory files and ZIP packaging.
//!
//! Every item is processed on its own; one bad file never stops the rest.

use crate::builder::{watermark_pdf, PdfOptions};
use crate::error::{Result, WatermarkError};
use crate::raster::watermark_image;
use crate::style::WatermarkStyle;
use crate::watermark::Compositor;
use image::ImageFormat;
use rayon::prelude::*;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MAX_BATCH_ITEMS: usize = 50;
pub const DEFAULT_OUTPUT_SUFFIX: &str = "_DRAFT";
pub const DEFAULT_ARCHIVE_NAME: &str = "watermarked_draft.zip";

/// A named input file held in memory.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Image(ImageFormat),
}

/// Pick the handler for a file from its extension.
pub fn detect_kind(name: &str) -> Result<InputKind> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => Ok(InputKind::Pdf),
        "jpg" | "jpeg" => Ok(InputKind::Image(ImageFormat::Jpeg)),
        "png" => Ok(InputKind::Image(ImageFormat::Png)),
        "webp" => Ok(InputKind::Image(ImageFormat::WebP)),
        "tif" | "tiff" => Ok(InputKind::Image(ImageFormat::Tiff)),
        "" => Err(WatermarkError::UnsupportedInputFormat(format!(
            "{name} has no extension"
        ))),
        other => Err(WatermarkError::UnsupportedInputFormat(format!(
            "{name} (.{other})"
        ))),
    }
}

/// `report.pdf` becomes `report_DRAFT.pdf`.
pub fn output_name(input: &str, suffix: &str) -> String {
    let path = Path::new(input);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    }
}

fn numbered(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{n}.{ext}"),
        None => format!("{name}-{n}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Stamped(OutputFile),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub input: String,
    pub outcome: ItemOutcome,
}

/// Per-item results, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn successes(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Stamped(_)))
    }

    pub fn failures(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped(_)))
    }

    pub fn outputs(&self) -> Vec<&OutputFile> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                ItemOutcome::Stamped(out) => Some(out),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.outcome)).count()
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_items: usize,
    pub output_suffix: String,
    pub pdf: PdfOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_items: MAX_BATCH_ITEMS,
            output_suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
            pdf: PdfOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    compositor: Compositor,
    style: WatermarkStyle,
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(compositor: Compositor, style: WatermarkStyle, options: BatchOptions) -> Self {
        Self {
            compositor,
            style,
            options,
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Watermark a single file, returning its output bytes.
    pub fn process_one(&self, input: &InputFile) -> Result<Vec<u8>> {
        match detect_kind(&input.name)? {
            InputKind::Pdf => Ok(watermark_pdf(
                &input.bytes,
                &self.compositor,
                &self.style,
                &self.options.pdf,
            )?
            .bytes),
            InputKind::Image(format) => watermark_image(
                &input.bytes,
                format,
                &self.compositor,
                &self.style,
                self.options.pdf.quality.jpeg_quality(),
            ),
        }
    }

    /// Process every input; fails only when the batch is over the limit.
    pub fn run(&self, inputs: &[InputFile]) -> Result<BatchReport> {
        if inputs.len() > self.options.max_items {
            return Err(WatermarkError::BatchTooLarge {
                count: inputs.len(),
                max: self.options.max_items,
            });
        }
        self.style.validate()?;

        let mut items: Vec<ItemReport> = inputs
            .par_iter()
            .map(|input| ItemReport {
                input: input.name.clone(),
                outcome: self.outcome_for(input),
            })
            .collect();

        let mut used = HashSet::new();
        for item in &mut items {
            if let ItemOutcome::Stamped(out) = &mut item.outcome {
                let base = out.name.clone();
                let mut n = 1;
                while !used.insert(out.name.clone()) {
                    n += 1;
                    out.name = numbered(&base, n);
                }
            }
        }

        let report = BatchReport { items };
        info!(
            total = inputs.len(),
            stamped = report.successes(),
            skipped = report.skipped(),
            failed = report.failures(),
            "Batch finished"
        );
        Ok(report)
    }

    fn outcome_for(&self, input: &InputFile) -> ItemOutcome {
        match self.process_one(input) {
            Ok(bytes) => ItemOutcome::Stamped(OutputFile {
                name: output_name(&input.name, &self.options.output_suffix),
                bytes,
            }),
            Err(e @ WatermarkError::UnsupportedInputFormat(_)) => {
                warn!(file = %input.name, error = %e, "Skipping file");
                ItemOutcome::Skipped(e.to_string())
            }
            Err(e) => {
                warn!(file = %input.name, error = %e, "Failed to watermark file");
                ItemOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Pack outputs into a Deflate-compressed ZIP archive.
pub fn package_zip<'a>(outputs: impl IntoIterator<Item = &'a OutputFile>) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for file in outputs {
        writer.start_file(file.name.as_str(), options)?;
        writer.write_all(&file.bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Read;

    #[rstest]
    #[case("a.pdf", InputKind::Pdf)]
    #[case("A.PDF", InputKind::Pdf)]
    #[case("scan.JPEG", InputKind::Image(ImageFormat::Jpeg))]
    #[case("x.jpg", InputKind::Image(ImageFormat::Jpeg))]
    #[case("dir/x.png", InputKind::Image(ImageFormat::Png))]
    #[case("x.webp", InputKind::Image(ImageFormat::WebP))]
    #[case("x.tif", InputKind::Image(ImageFormat::Tiff))]
    fn test_detect_kind(#[case] name: &str, #[case] expected: InputKind) {
        assert_eq!(detect_kind(name).unwrap(), expected);
    }

    #[rstest]
    #[case("notes.txt")]
    #[case("README")]
    #[case("archive.zip")]
    fn test_detect_kind_unsupported(#[case] name: &str) {
        assert!(matches!(
            detect_kind(name),
            Err(WatermarkError::UnsupportedInputFormat(_))
        ));
    }

    #[rstest]
    #[case("report.pdf", "report_DRAFT.pdf")]
    #[case("in/photo.final.jpg", "photo.final_DRAFT.jpg")]
    #[case("noext", "noext_DRAFT")]
    fn test_output_name(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(output_name(input, DEFAULT_OUTPUT_SUFFIX), expected);
    }

    #[test]
    fn test_numbered() {
        assert_eq!(numbered("a_DRAFT.pdf", 2), "a_DRAFT-2.pdf");
        assert_eq!(numbered("a_DRAFT", 3), "a_DRAFT-3");
    }

    #[test]
    fn test_report_counts() {
        let report = BatchReport {
            items: vec![
                ItemReport {
                    input: "a".into(),
                    outcome: ItemOutcome::Stamped(OutputFile {
                        name: "a".into(),
                        bytes: vec![1],
                    }),
                },
                ItemReport {
                    input: "b".into(),
                    outcome: ItemOutcome::Skipped("x".into()),
                },
                ItemReport {
                    input: "c".into(),
                    outcome: ItemOutcome::Failed("y".into()),
                },
            ],
        };
        assert_eq!(report.successes(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.outputs().len(), 1);
    }

    #[test]
    fn test_oversized_batch_rejected_before_work() {
        let processor = BatchProcessor::new(
            Compositor::default(),
            WatermarkStyle::default(),
            BatchOptions {
                max_items: 2,
                ..BatchOptions::default()
            },
        );
        let inputs: Vec<InputFile> = (0..3)
            .map(|i| InputFile::new(format!("{i}.pdf"), Vec::new()))
            .collect();
        assert!(matches!(
            processor.run(&inputs),
            Err(WatermarkError::BatchTooLarge { count: 3, max: 2 })
        ));
    }

    #[test]
    fn test_package_zip_contains_entries() {
        let files = vec![
            OutputFile {
                name: "a_DRAFT.pdf".into(),
                bytes: b"%PDF-1.4 a".to_vec(),
            },
            OutputFile {
                name: "b_DRAFT.png".into(),
                bytes: vec![7; 1000],
            },
        ];
        let bytes = package_zip(&files).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut entry = archive.by_name("b_DRAFT.png").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, vec![7; 1000]);
    }
}
