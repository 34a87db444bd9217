use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use draft_stamp::batch::{package_zip, BatchProcessor, InputFile, ItemOutcome};
use draft_stamp::config::AppConfig;
use draft_stamp::font::{resolve_renderer, BUILTIN_FONT_NAME};
use draft_stamp::logging::{init_subscriber, LogFormat};
use draft_stamp::style::{alpha_from_opacity, parse_hex_color, AnchorPolicy};
use draft_stamp::{Compositor, WatermarkError};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "draft-stamp", version)]
#[command(about = "Stamp a translucent DRAFT watermark onto PDFs and images")]
struct Args {
    /// PDF, JPEG, PNG, WEBP or TIFF files to stamp
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Watermark text
    #[arg(long)]
    text: Option<String>,

    /// Text color, #RGB or #RRGGBB
    #[arg(long)]
    color: Option<String>,

    /// Text angle in degrees, counter-clockwise
    #[arg(long, allow_hyphen_values = true)]
    angle: Option<i32>,

    /// Opacity from 0.0 to 1.0
    #[arg(long)]
    opacity: Option<f64>,

    /// center or bottom-left
    #[arg(long, value_parser = parse_anchor)]
    anchor: Option<AnchorPolicy>,

    /// TrueType/OpenType font file, tried before configured fonts (repeatable).
    /// Without one the coarse built-in block font is used
    #[arg(long = "font")]
    fonts: Vec<PathBuf>,

    /// Rebuild image-only PDFs from stamped page rasters
    #[arg(long)]
    flatten: bool,

    /// "lossless" or 1-100 (JPEG)
    #[arg(long)]
    quality: Option<String>,

    /// Directory for stamped files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Also write all outputs into a ZIP archive
    #[arg(long)]
    zip: bool,

    /// pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Log level or filter directive; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_anchor(s: &str) -> std::result::Result<AnchorPolicy, String> {
    s.parse().map_err(|e: WatermarkError| e.to_string())
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(text) = &args.text {
        config.style.text = text.clone();
    }
    if let Some(color) = &args.color {
        config.style.color = parse_hex_color(color)?;
    }
    if let Some(angle) = args.angle {
        config.style.base_angle = angle;
    }
    if let Some(opacity) = args.opacity {
        config.style.alpha = alpha_from_opacity(opacity);
    }
    if let Some(anchor) = args.anchor {
        config.style.anchor = anchor;
    }
    if args.flatten {
        config.pdf.flatten = true;
    }
    if let Some(quality) = &args.quality {
        config.pdf.quality = quality.clone();
    }
    if !args.fonts.is_empty() {
        let mut fonts = args.fonts.clone();
        fonts.append(&mut config.fonts);
        config.fonts = fonts;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_subscriber(args.log_format, &args.log_level).map_err(|e| anyhow!(e))?;

    let config = load_config(&args)?;
    let options = config.batch_options()?;

    if args.inputs.len() > options.max_items {
        return Err(WatermarkError::BatchTooLarge {
            count: args.inputs.len(),
            max: options.max_items,
        }
        .into());
    }

    let compositor = Compositor::new(resolve_renderer(&config.font_sources()));
    if compositor.renderer().name() == BUILTIN_FONT_NAME {
        warn!(
            font = BUILTIN_FONT_NAME,
            "No usable font file given; pass --font for smooth text"
        );
    }
    info!(
        files = args.inputs.len(),
        font = compositor.renderer().name(),
        text = %config.style.text,
        output_dir = %args.output_dir.display(),
        "Starting"
    );

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        inputs.push(InputFile::new(name, bytes));
    }

    let processor = BatchProcessor::new(compositor, config.style.clone(), options);
    let report = processor.run(&inputs)?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    for item in &report.items {
        match &item.outcome {
            ItemOutcome::Stamped(out) => {
                let path = args.output_dir.join(&out.name);
                std::fs::write(&path, &out.bytes)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(input = %item.input, output = %path.display(), "Stamped");
            }
            ItemOutcome::Skipped(reason) => warn!(input = %item.input, %reason, "Skipped"),
            ItemOutcome::Failed(reason) => warn!(input = %item.input, %reason, "Failed"),
        }
    }

    let outputs = report.outputs();
    if args.zip && !outputs.is_empty() {
        let archive = package_zip(outputs)?;
        let path = args.output_dir.join(&config.batch.archive_name);
        std::fs::write(&path, archive).with_context(|| format!("writing {}", path.display()))?;
        info!(archive = %path.display(), "Wrote archive");
    }

    info!(
        stamped = report.successes(),
        skipped = report.skipped(),
        failed = report.failures(),
        "Done"
    );

    if report.failures() > 0 {
        bail!("{} of {} files failed", report.failures(), report.items.len());
    }
    Ok(())
}
