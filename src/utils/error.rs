//! Error Handling Module
//!
//! Defines the error type shared by the dataset pipeline, the networks,
//! training and inference. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for srnet operations
#[derive(Error, Debug)]
pub enum SrError {
    /// Training or evaluation was requested before the patch store was written
    #[error("Dataset '{0}' has not been saved; materialize its patches first")]
    DatasetNotSaved(PathBuf),

    /// Upscale blocks only exist for factors 2, 3 and 4
    #[error("Unsupported upscale factor {0}: scale should be 2, 3 or 4")]
    UnsupportedScale(usize),

    /// Patches from random slicing cannot be merged back into an image
    #[error("Cannot merge patches: dataset slice mode is '{0}', expected 'normal'")]
    IncompleteBlocks(String),

    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with image processing or encoding
    #[error("Image error: {0}")]
    Image(String),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error reading or writing the on-disk patch store
    #[error("Patch store error: {0}")]
    Store(String),

    /// Error with model construction or forward shapes
    #[error("Model error: {0}")]
    Model(String),

    /// Error saving or loading weights
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SrError {
    fn from(err: serde_json::Error) -> Self {
        SrError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for SrError {
    fn from(err: image::ImageError) -> Self {
        SrError::Image(err.to_string())
    }
}

/// Convenience Result type for srnet operations
pub type Result<T> = std::result::Result<T, SrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SrError::UnsupportedScale(5);
        assert_eq!(
            format!("{}", err),
            "Unsupported upscale factor 5: scale should be 2, 3 or 4"
        );
    }

    #[test]
    fn test_dataset_not_saved_mentions_path() {
        let err = SrError::DatasetNotSaved(PathBuf::from("data/train"));
        assert!(format!("{}", err).contains("data/train"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SrError = io_err.into();
        assert!(matches!(err, SrError::Io(_)));
    }
}
