/// Pipeline configuration.
///
/// Everything the engine needs arrives through these structs; there is no
/// global settings store in the core. All of them are serde-derived so a
/// JSON options file and CLI flags map onto the same surface.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConversionError, Result};

/// How chapter titles are derived during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TitleMode {
    /// Prefer nav/NCX titles, then heading tags, then leading text.
    #[default]
    Auto,
    /// Always take the first non-empty of `<title>`, `<h1>`..`<h3>`.
    TagText,
    /// Always take the first 60 characters of the normalized text.
    FirstFew,
}

/// How newline runs in the stripped text are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NewlineMode {
    /// Any run of newlines collapses to the break string.
    Single,
    /// Two or more newlines collapse to the break string; an isolated
    /// newline becomes a single space.
    #[default]
    Double,
    /// Every newline becomes a single space.
    None,
}

/// One user-supplied regex replacement, applied in order over the full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReplaceRule {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    #[serde(default)]
    pub title_mode: TitleMode,
    #[serde(default)]
    pub newline_mode: NewlineMode,
    #[serde(default = "default_break_string")]
    pub break_string: String,
    #[serde(default = "default_true")]
    pub apply_footnote_cleanup: bool,
    #[serde(default)]
    pub search_replace_rules: Vec<SearchReplaceRule>,
}

fn default_break_string() -> String {
    "\n\n".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        NormalizationConfig {
            title_mode: TitleMode::default(),
            newline_mode: NewlineMode::default(),
            break_string: default_break_string(),
            apply_footnote_cleanup: true,
            search_replace_rules: Vec::new(),
        }
    }
}

/// Hard ceiling on synthesis workers regardless of CPU count.
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Opaque voice identifier from the adapter's enumeration.
    pub voice: String,
    /// BCP 47 language tag handed to the synthesizer.
    #[serde(default)]
    pub language: Option<String>,
    /// Requested worker cap; the effective count is clamped, see
    /// [`TtsConfig::effective_workers`].
    #[serde(default = "default_workers")]
    pub parallel_workers: usize,
}

fn default_workers() -> usize {
    MAX_WORKERS
}

impl TtsConfig {
    pub fn new(voice: impl Into<String>) -> Self {
        TtsConfig {
            voice: voice.into(),
            language: None,
            parallel_workers: MAX_WORKERS,
        }
    }

    /// `max(1, min(CPU, chapters, user cap, 8))`
    pub fn effective_workers(&self, chapter_count: usize) -> usize {
        num_cpus::get()
            .min(chapter_count)
            .min(self.parallel_workers)
            .min(MAX_WORKERS)
            .max(1)
    }
}

/// Final container flavor. Only the extension and codec change; the
/// pipeline itself is format-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    M4b,
    Mp3,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::M4b => "m4b",
            OutputFormat::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// User-chosen directory receiving the container, the sidecar and the
    /// session folder.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    /// Target bitrate handed to the encoder.
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
}

fn default_bitrate() -> u32 {
    96
}

/// Complete configuration for one conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOptions {
    pub normalization: NormalizationConfig,
    pub tts: TtsConfig,
    pub output: OutputConfig,
}

impl ConversionOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| ConversionError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_workers_clamp() {
        let mut cfg = TtsConfig::new("test");
        cfg.parallel_workers = 100;
        // Never above the hard cap or the chapter count.
        assert!(cfg.effective_workers(100) <= MAX_WORKERS);
        assert_eq!(cfg.effective_workers(2).min(2), cfg.effective_workers(2));

        cfg.parallel_workers = 0;
        // At least one worker even for a zero request.
        assert_eq!(cfg.effective_workers(10), 1);

        cfg.parallel_workers = 4;
        assert_eq!(cfg.effective_workers(1), 1);
    }

    #[test]
    fn test_normalization_defaults() {
        let cfg = NormalizationConfig::default();
        assert_eq!(cfg.title_mode, TitleMode::Auto);
        assert_eq!(cfg.newline_mode, NewlineMode::Double);
        assert_eq!(cfg.break_string, "\n\n");
        assert!(cfg.apply_footnote_cleanup);
    }

    #[test]
    fn test_options_roundtrip() {
        let json = r#"{
            "normalization": { "newline_mode": "none", "title_mode": "first-few" },
            "tts": { "voice": "en_US-amy-medium", "parallel_workers": 2 },
            "output": { "output_dir": "/tmp/out", "format": "mp3", "bitrate_kbps": 128 }
        }"#;
        let opts: std::result::Result<ConversionOptions, _> = serde_json::from_str(json);
        let opts = opts.unwrap();
        assert_eq!(opts.normalization.newline_mode, NewlineMode::None);
        assert_eq!(opts.output.format, OutputFormat::Mp3);
        assert_eq!(opts.output.bitrate_kbps, 128);
        assert_eq!(opts.tts.parallel_workers, 2);
    }

    #[test]
    fn test_options_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(
            &path,
            r#"{
                "normalization": {},
                "tts": { "voice": "amy" },
                "output": { "output_dir": "/tmp/books" }
            }"#,
        )
        .unwrap();

        let opts = ConversionOptions::load(&path).unwrap();
        assert_eq!(opts.tts.voice, "amy");
        assert_eq!(opts.tts.parallel_workers, MAX_WORKERS);
        assert_eq!(opts.output.bitrate_kbps, 96);

        assert!(ConversionOptions::load(&dir.path().join("missing.json")).is_err());
    }
}
