//! roudoku converts DRM-free EPUB books into narrated audiobooks.
//!
//! The pipeline: the EPUB reader resolves the spine into an ordered chapter
//! list, the text normalizer turns chapter HTML into speakable text, the
//! synthesis scheduler fans chapters out to a neural TTS adapter with an
//! adaptive bisection fallback for token overflows, and the audio assembler
//! unifies the PCM streams into a tagged, chaptered container.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{ConversionOptions, NormalizationConfig, OutputConfig, TtsConfig};
pub use error::{ConversionError, Result};
pub use models::{AudiobookArtifact, Book, CancelFlag, ConversionStatus, ProgressUpdate};
pub use services::conversion_engine::{cleanup_session, ConversionEngine};
