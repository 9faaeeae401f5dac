use std::path::PathBuf;
use thiserror::Error;

use crate::services::media_encoder::EncodeError;
use crate::services::tts_adapter::SynthesisError;

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Invalid EPUB archive: {0}")]
    InvalidArchive(String),

    #[error("EPUB has no META-INF/container.xml")]
    MissingContainer,

    #[error("container.xml declares no package document")]
    MissingOpf,

    #[error("Spine contains no readable chapters")]
    EmptySpine,

    #[error("Normalization failed: {0}")]
    NormalizationFailed(String),

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Format conversion failed: {0}")]
    FormatConversionFailed(String),

    #[error("Transcoding failed: {0}")]
    TranscodeFailed(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConversionError {
    /// Attach the offending path to an IO failure.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConversionError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<SynthesisError> for ConversionError {
    fn from(e: SynthesisError) -> Self {
        match e {
            // A token overflow that escapes the scheduler's bisection is a
            // synthesis failure; the recoverable case never reaches callers.
            SynthesisError::TokenLimitExceeded => {
                ConversionError::SynthesisFailed("token limit exceeded".to_string())
            }
            SynthesisError::Failed(msg) => ConversionError::SynthesisFailed(msg),
        }
    }
}

impl From<EncodeError> for ConversionError {
    fn from(e: EncodeError) -> Self {
        ConversionError::TranscodeFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConversionError>;
