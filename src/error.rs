use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Landmark group '{0}' not found")]
    MissingLandmarkGroup(String),

    #[error("Image has no landmark groups")]
    NoLandmarks,

    #[error("Landmark count mismatch: expected {expected}, got {actual}")]
    LandmarkCountMismatch { expected: usize, actual: usize },

    #[error("Inconsistent batch: {0}")]
    InconsistentBatch(String),

    #[error("No training images were provided")]
    NoTrainingImages,

    #[error("Fitting requires a trained cascade")]
    NotTrained,

    #[error("Regression solve failed: {0}")]
    Regression(String),

    #[error("Invalid landmark file {path}: {reason}")]
    LandmarkParse { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
