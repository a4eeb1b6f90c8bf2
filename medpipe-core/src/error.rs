//! Error types for transform pipelines

use thiserror::Error;

/// Result type for transform pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for transform pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// An argument had the wrong kind of value (e.g. a non-boolean lazy flag)
    #[error("Type error: {0}")]
    Type(String),

    /// An argument had an invalid value (e.g. empty keys, probability outside [0, 1])
    #[error("Value error: {0}")]
    Value(String),

    /// A required key was absent from a record
    #[error(
        "Key `{key}` of transform `{transform}` was missing in the data and allow_missing_keys==false"
    )]
    MissingKey {
        /// The missing key
        key: String,
        /// Name of the transform that required it
        transform: String,
    },

    /// A transform failed while running inside a pipeline
    #[error("applying transform {transform}")]
    Transform {
        /// Name of the failing transform
        transform: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A record's provenance could not be inverted
    #[error("Inversion error: {0}")]
    Inversion(String),

    /// A required hook was not implemented by a transform
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Array shape mismatch
    #[error("Shape error: {0}")]
    Shape(String),

    /// ndarray rejected a shape
    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wrap `self` as the cause of a failure in `transform`
    pub fn in_transform(self, transform: impl Into<String>) -> Self {
        Error::Transform {
            transform: transform.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error of a chain of transform failures
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Transform { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
