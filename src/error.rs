//! Error types shared by the compositor, the document sinks and the batch layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WatermarkError>;

/// Errors that can occur while stamping a watermark.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// Page or image dimensions that cannot hold a watermark (zero, negative, non-finite).
    #[error("invalid page geometry: {0}")]
    InvalidGeometry(String),

    /// The input file type is not one we know how to stamp.
    #[error("unsupported input format: {0}")]
    UnsupportedInputFormat(String),

    /// The stamped document or image could not be re-serialized.
    #[error("failed to encode output: {0}")]
    EncodingFailure(String),

    /// Text could not be rendered into the overlay tile.
    #[error("failed to render watermark text: {0}")]
    Render(String),

    /// Invalid style or application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// More inputs than the batch ceiling allows.
    #[error("batch of {count} files exceeds the limit of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pdf(#[from] lopdf::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WatermarkError::InvalidGeometry("width must be positive, got 0".to_string());
        assert_eq!(
            err.to_string(),
            "invalid page geometry: width must be positive, got 0"
        );

        let err = WatermarkError::UnsupportedInputFormat("notes.docx".to_string());
        assert_eq!(err.to_string(), "unsupported input format: notes.docx");

        let err = WatermarkError::BatchTooLarge { count: 51, max: 50 };
        assert_eq!(err.to_string(), "batch of 51 files exceeds the limit of 50");
    }

    #[test]
    fn test_io_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.pdf");
        let err: WatermarkError = io.into();
        assert_eq!(err.to_string(), "missing.pdf");
    }
}
