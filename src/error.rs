use std::path::PathBuf;

/// Errors raised while building the network or loading its trained parameters.
///
/// All of them are fatal at startup: the service never starts serving with a graph that
/// doesn't match its parameter file.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("Unknown activation '{0}', expected one of: relu, leakyrelu")]
    UnknownActivation(String),

    #[error("The architecture must declare at least one convolutional layer")]
    EmptyConvStack,

    #[error("Invalid layer {layer}: {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("Failed to read parameters from '{}': {reason}", path.display())]
    Record { path: PathBuf, reason: String },

    #[error("Parameter '{param}' has shape {actual:?}, the architecture expects {expected:?}")]
    ShapeMismatch {
        param: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Parameter '{0}' is missing from the record")]
    MissingParam(String),

    #[error("The record holds {actual} {stage} stages, the architecture declares {expected}")]
    StageCountMismatch {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("The model outputs {classes} classes but the label map holds {labels} labels")]
    LabelCountMismatch { classes: usize, labels: usize },
}

/// Errors raised while classifying a single image.
#[derive(thiserror::Error, Debug)]
pub enum PredictError {
    #[error("The uploaded image is empty")]
    EmptyImage,

    #[error("Could not decode the uploaded image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("The model produced no comparable score")]
    NoScore,

    #[error("Class index {0} has no label")]
    UnknownClass(usize),
}

impl PredictError {
    /// Whether the error was caused by the request content rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::EmptyImage | Self::Decode(_))
    }
}

/// Errors raised while assembling the service configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load '{}': {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("Invalid allowed origin '{0}'")]
    InvalidOrigin(String),
}

/// Errors that abort the server binary.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
