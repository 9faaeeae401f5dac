use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A parsed book, immutable once the EPUB reader returns it.
///
/// Chapter order equals spine reading order, never filename order.
#[derive(Debug, Clone)]
pub struct Book {
    pub title: String,
    pub author: String,
    pub cover: Option<Vec<u8>>,
    pub chapters: Vec<Chapter>,
}

impl Book {
    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }
}

/// One spine entry with its source markup.
#[derive(Debug, Clone)]
pub struct Chapter {
    /// Dense 0-based spine position.
    pub index: usize,
    /// Display title resolved from the navigation document, NCX, or the
    /// href fallback chain.
    pub title: String,
    /// Whether `title` came from a nav/NCX entry rather than a fallback.
    pub title_from_toc: bool,
    /// Archive path of the content document.
    pub href: String,
    pub html: Vec<u8>,
}

/// A chapter after text normalization, ready for synthesis.
#[derive(Debug, Clone)]
pub struct NormalizedChapter {
    pub index: usize,
    pub title: String,
    pub text: String,
}

/// Raw sample layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Int16,
    Float32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Float32 => 4,
        }
    }
}

/// Sample rate / channel / layout tuple describing a PCM stream.
///
/// The format of the first buffer a conversion produces becomes the target
/// format; all later buffers are either bit-identical to it or converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
}

impl AudioFormat {
    pub fn mono_int16(sample_rate: u32) -> Self {
        AudioFormat {
            sample_rate,
            channels: 1,
            sample_format: SampleFormat::Int16,
            interleaved: true,
        }
    }

    pub fn mono_float32(sample_rate: u32) -> Self {
        AudioFormat {
            sample_rate,
            channels: 1,
            sample_format: SampleFormat::Float32,
            interleaved: true,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let layout = match self.sample_format {
            SampleFormat::Int16 => "s16",
            SampleFormat::Float32 => "f32",
        };
        write!(f, "{} Hz/{} ch/{}", self.sample_rate, self.channels, layout)
    }
}

/// Typed sample storage backing a [`PcmBuffer`].
#[derive(Debug, Clone)]
pub enum SampleData {
    Int16(Vec<i16>),
    Float32(Vec<f32>),
}

impl SampleData {
    pub fn sample_count(&self) -> usize {
        match self {
            SampleData::Int16(v) => v.len(),
            SampleData::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }
}

/// One synthesized PCM chunk. Produced by the TTS adapter, consumed exactly
/// once by the assembler.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    pub format: AudioFormat,
    pub data: SampleData,
}

impl PcmBuffer {
    pub fn new(format: AudioFormat, data: SampleData) -> Self {
        debug_assert!(format.channels > 0);
        PcmBuffer { format, data }
    }

    pub fn frames(&self) -> usize {
        self.data.sample_count() / self.format.channels as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.format.sample_rate as f64
    }
}

/// Per-chapter synthesis result handed from the scheduler to the assembler.
#[derive(Debug)]
pub struct ChapterAudio {
    pub index: usize,
    pub title: String,
    pub buffers: Vec<PcmBuffer>,
    /// Seconds of audio at the buffers' native sample rates.
    pub duration: f64,
}

/// Everything a finished conversion leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudiobookArtifact {
    pub container: PathBuf,
    pub sidecar: PathBuf,
    pub session_dir: PathBuf,
    pub duration: f64,
    /// Token-limit bisections observed during synthesis; surfaced as a
    /// warning in the run summary, never an error.
    pub limit_hits: usize,
}

/// One sidecar entry. Field order keeps the serialized keys sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterMark {
    pub start: f64,
    pub title: String,
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversionStatus {
    Idle,
    Parsing,
    Normalizing,
    Synthesizing,
    Assembling,
    Complete,
    Cancelled,
    Failed,
}

impl std::fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversionStatus::Idle => "idle",
            ConversionStatus::Parsing => "parsing",
            ConversionStatus::Normalizing => "normalizing",
            ConversionStatus::Synthesizing => "synthesizing",
            ConversionStatus::Assembling => "assembling",
            ConversionStatus::Complete => "complete",
            ConversionStatus::Cancelled => "cancelled",
            ConversionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot sent over the progress channel at state transitions and per
/// completed chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub fraction: f32,
    pub status: ConversionStatus,
    pub status_text: String,
    /// Session log lines appended since the previous update.
    pub log_entries: Vec<String>,
}

/// Shared cooperative cancellation flag. `cancel` is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity and folder of one conversion run. The folder persists after
/// completion or failure until the user asks for cleanup.
#[derive(Debug, Clone)]
pub struct ConversionSession {
    pub id: Uuid,
    pub dir: PathBuf,
}

impl ConversionSession {
    pub fn folder_name(id: &Uuid) -> String {
        format!("conversion_{id}")
    }
}
