/// TTS Adapter
///
/// Uniform contract over the neural synthesizer. The model itself is opaque:
/// the pipeline only sees `voices()` for capability discovery and
/// `synthesize(text, voice, language)` returning PCM buffers. The token
/// overflow case is a distinguished error so the scheduler can recover by
/// bisection without inspecting message strings.
///
/// The concrete default drives a Piper-style CLI: one process spawn per
/// call, raw 16-bit mono PCM on stdout, voice models discovered from an
/// `.onnx` + `.onnx.json` pair per voice. Sessions are created per worker;
/// nothing is shared across workers.
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::models::{AudioFormat, PcmBuffer, SampleData};

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("input exceeds the synthesizer token limit")]
    TokenLimitExceeded,

    #[error("{0}")]
    Failed(String),
}

pub type SynthesisResult<T> = std::result::Result<T, SynthesisError>;

/// One voice the synthesizer can speak with, including the canonical output
/// format all of its buffers share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub language: Option<String>,
    pub native_format: AudioFormat,
}

/// A per-worker synthesis session. Stateless between chapters; consecutive
/// calls for the same voice yield buffers of identical format.
#[async_trait]
pub trait SpeechSynthesizer: Send {
    async fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        language: Option<&str>,
    ) -> SynthesisResult<Vec<PcmBuffer>>;
}

/// Factory and capability surface handed to the scheduler.
#[async_trait]
pub trait SynthesizerProvider: Send + Sync {
    async fn voices(&self) -> SynthesisResult<Vec<VoiceInfo>>;

    /// Build a fresh session for one worker. The underlying model instance
    /// must not be shared between sessions.
    async fn create_session(&self) -> SynthesisResult<Box<dyn SpeechSynthesizer>>;
}

/// Stderr shapes the external engine uses when the input blew its context.
static TOKEN_OVERFLOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)token|context length|input (is )?too long|max.*length").unwrap());

/// Sidecar config written next to each Piper voice model.
#[derive(Deserialize)]
struct PiperVoiceConfig {
    audio: PiperAudioConfig,
    #[serde(default)]
    language: Option<PiperLanguageConfig>,
}

#[derive(Deserialize)]
struct PiperAudioConfig {
    sample_rate: u32,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PiperLanguageConfig {
    code: Option<String>,
}

/// Default adapter: spawns an external Piper-style binary per call.
pub struct PiperProvider {
    binary: PathBuf,
    voices_dir: PathBuf,
}

impl PiperProvider {
    pub fn new(voices_dir: impl Into<PathBuf>, binary: Option<PathBuf>) -> SynthesisResult<Self> {
        let binary = match binary {
            Some(b) => b,
            None => which::which("piper").map_err(|e| {
                SynthesisError::Failed(format!("piper binary not found on PATH: {e}"))
            })?,
        };
        Ok(PiperProvider {
            binary,
            voices_dir: voices_dir.into(),
        })
    }

    fn load_voice(&self, model_path: &Path) -> Option<VoiceInfo> {
        let stem = model_path.file_stem()?.to_str()?.to_string();
        let config_path = model_path.with_extension("onnx.json");
        let config_bytes = std::fs::read(&config_path).ok()?;
        let config: PiperVoiceConfig = serde_json::from_slice(&config_bytes).ok()?;
        Some(VoiceInfo {
            id: stem,
            language: config.language.and_then(|l| l.code),
            native_format: AudioFormat::mono_int16(config.audio.sample_rate),
        })
    }
}

#[async_trait]
impl SynthesizerProvider for PiperProvider {
    async fn voices(&self) -> SynthesisResult<Vec<VoiceInfo>> {
        let entries = std::fs::read_dir(&self.voices_dir).map_err(|e| {
            SynthesisError::Failed(format!(
                "cannot list voices in {}: {e}",
                self.voices_dir.display()
            ))
        })?;
        let mut voices = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "onnx") {
                match self.load_voice(&path) {
                    Some(voice) => voices.push(voice),
                    None => {
                        log::warn!(
                            "[TtsAdapter] skipping voice model without readable config: {}",
                            path.display()
                        );
                    }
                }
            }
        }
        voices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(voices)
    }

    async fn create_session(&self) -> SynthesisResult<Box<dyn SpeechSynthesizer>> {
        Ok(Box::new(PiperSession {
            binary: self.binary.clone(),
            voices_dir: self.voices_dir.clone(),
        }))
    }
}

struct PiperSession {
    binary: PathBuf,
    voices_dir: PathBuf,
}

impl PiperSession {
    fn model_path(&self, voice: &str) -> PathBuf {
        self.voices_dir.join(format!("{voice}.onnx"))
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSession {
    async fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        _language: Option<&str>,
    ) -> SynthesisResult<Vec<PcmBuffer>> {
        let model = self.model_path(voice);
        if !model.exists() {
            return Err(SynthesisError::Failed(format!(
                "unknown voice {voice}: no model at {}",
                model.display()
            )));
        }
        let config_path = model.with_extension("onnx.json");
        let config_bytes = std::fs::read(&config_path)
            .map_err(|e| SynthesisError::Failed(format!("voice config unreadable: {e}")))?;
        let config: PiperVoiceConfig = serde_json::from_slice(&config_bytes)
            .map_err(|e| SynthesisError::Failed(format!("voice config invalid: {e}")))?;

        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&model)
            .arg("--output-raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SynthesisError::Failed(format!("failed to spawn synthesizer: {e}")))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| SynthesisError::Failed("synthesizer stdin unavailable".into()))?;
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| SynthesisError::Failed(format!("failed to send text: {e}")))?;
            // Dropping stdin closes the pipe and lets the engine finish.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SynthesisError::Failed(format!("synthesizer did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if TOKEN_OVERFLOW.is_match(&stderr) {
                return Err(SynthesisError::TokenLimitExceeded);
            }
            return Err(SynthesisError::Failed(format!(
                "synthesizer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let mut samples = vec![0i16; output.stdout.len() / 2];
        LittleEndian::read_i16_into(&output.stdout[..samples.len() * 2], &mut samples);

        Ok(vec![PcmBuffer::new(
            AudioFormat::mono_int16(config.audio.sample_rate),
            SampleData::Int16(samples),
        )])
    }
}
