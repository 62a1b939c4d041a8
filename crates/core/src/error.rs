use thiserror::Error;

/// Errors raised while configuring, building or loading a RangeViT model.
#[derive(Error, Debug)]
pub enum RangeViTError {
    #[error("unknown ViT backbone: {0}")]
    UnknownBackbone(String),

    #[error("unknown decoder: {0}")]
    UnknownDecoder(String),

    #[error("unknown stem: {0}")]
    UnknownStem(String),

    #[error("invalid patch geometry: {0}")]
    InvalidPatch(String),

    #[error("invalid skip connection: {0}")]
    InvalidSkip(String),

    #[error("invalid KPConv config: {0}")]
    InvalidKpConv(String),

    #[error("model was built without a KPConv classifier")]
    MissingPointHead,

    #[error("point count mismatch: {expected} points declared, {found} provided")]
    PointCountMismatch { expected: usize, found: usize },

    #[error("point batch holds {samples} samples but the image batch has {images}")]
    SampleCountMismatch { images: usize, samples: usize },

    #[error("shape mismatch for {key}: checkpoint {checkpoint:?}, model {model:?}")]
    ShapeMismatch {
        key: String,
        checkpoint: Vec<usize>,
        model: Vec<usize>,
    },

    #[error("failed to read checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, RangeViTError>;
