/// End-to-end pipeline tests with scripted synthesizer and encoder doubles.
///
/// Each test builds a small EPUB on disk, runs the conversion engine against
/// it, and inspects the artifacts: container, chapters.json sidecar, and the
/// preserved session folder.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use roudoku::config::{
    ConversionOptions, NewlineMode, NormalizationConfig, OutputConfig, OutputFormat, TtsConfig,
};
use roudoku::error::ConversionError;
use roudoku::models::{
    AudioFormat, CancelFlag, ChapterMark, ConversionStatus, PcmBuffer, SampleData, SampleFormat,
};
use roudoku::services::media_encoder::{ContainerTags, EncodeResult, MediaEncoder, TranscodeSpec};
use roudoku::services::tts_adapter::{
    SpeechSynthesizer, SynthesisError, SynthesisResult, SynthesizerProvider, VoiceInfo,
};
use roudoku::ConversionEngine;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

// ---------------------------------------------------------------------------
// EPUB fixture builder

struct EpubFixture<'a> {
    title: &'a str,
    chapters: Vec<(&'a str, &'a str)>,
    cover: Option<&'a [u8]>,
}

impl<'a> EpubFixture<'a> {
    fn new(title: &'a str) -> Self {
        EpubFixture {
            title,
            chapters: Vec::new(),
            cover: None,
        }
    }

    fn chapter(mut self, href: &'a str, html: &'a str) -> Self {
        self.chapters.push((href, html));
        self
    }

    fn cover(mut self, bytes: &'a [u8]) -> Self {
        self.cover = Some(bytes);
        self
    }

    fn write(&self, path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();

        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
        )
        .unwrap();

        let mut manifest = String::new();
        let mut spine = String::new();
        for (i, (href, _)) in self.chapters.iter().enumerate() {
            manifest.push_str(&format!(
                "    <item id=\"ch{i}\" href=\"{href}\" media-type=\"application/xhtml+xml\"/>\n"
            ));
            spine.push_str(&format!("    <itemref idref=\"ch{i}\"/>\n"));
        }
        let mut meta = String::new();
        if self.cover.is_some() {
            manifest.push_str(
                "    <item id=\"cover-img\" href=\"cover.png\" media-type=\"image/png\"/>\n",
            );
            meta.push_str("    <meta name=\"cover\" content=\"cover-img\"/>\n");
        }
        let opf = format!(
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:dc="http://purl.org/dc/elements/1.1/" version="3.0">
  <metadata>
    <dc:title>{}</dc:title>
    <dc:creator>Test Author</dc:creator>
{meta}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine>
{spine}  </spine>
</package>"#,
            self.title
        );
        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(opf.as_bytes()).unwrap();

        for (href, html) in &self.chapters {
            zip.start_file(format!("OEBPS/{href}"), options).unwrap();
            zip.write_all(html.as_bytes()).unwrap();
        }
        if let Some(cover) = self.cover {
            zip.start_file("OEBPS/cover.png", options).unwrap();
            zip.write_all(cover).unwrap();
        }
        zip.finish().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Synthesizer double

#[derive(Clone, Copy)]
enum FrameRule {
    Fixed(usize),
    PerChar(usize),
}

#[derive(Clone)]
struct SessionSpec {
    format: AudioFormat,
    frames: FrameRule,
}

struct MockProvider {
    /// Per-session format/frame behavior, indexed by session creation
    /// order; the last entry repeats.
    specs: Vec<SessionSpec>,
    token_limit: Option<usize>,
    always_fail: bool,
    sessions: AtomicUsize,
    completions: Arc<AtomicUsize>,
    /// Cancel this flag once N synthesize calls have completed.
    cancel_after: Option<usize>,
    cancel_slot: Arc<Mutex<Option<CancelFlag>>>,
    /// Serialize synthesize calls so completion order is deterministic even
    /// with several workers.
    serialize: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl MockProvider {
    fn fixed(format: AudioFormat, frames: usize) -> Self {
        Self::with_specs(vec![SessionSpec {
            format,
            frames: FrameRule::Fixed(frames),
        }])
    }

    fn per_char(format: AudioFormat, frames_per_char: usize) -> Self {
        Self::with_specs(vec![SessionSpec {
            format,
            frames: FrameRule::PerChar(frames_per_char),
        }])
    }

    fn with_specs(specs: Vec<SessionSpec>) -> Self {
        MockProvider {
            specs,
            token_limit: None,
            always_fail: false,
            sessions: AtomicUsize::new(0),
            completions: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
            cancel_slot: Arc::new(Mutex::new(None)),
            serialize: None,
        }
    }
}

struct MockSession {
    spec: SessionSpec,
    token_limit: Option<usize>,
    always_fail: bool,
    completions: Arc<AtomicUsize>,
    cancel_after: Option<usize>,
    cancel_slot: Arc<Mutex<Option<CancelFlag>>>,
    serialize: Option<Arc<tokio::sync::Mutex<()>>>,
}

#[async_trait]
impl SynthesizerProvider for MockProvider {
    async fn voices(&self) -> SynthesisResult<Vec<VoiceInfo>> {
        Ok(vec![VoiceInfo {
            id: "v".to_string(),
            language: Some("en".to_string()),
            native_format: self.specs[0].format,
        }])
    }

    async fn create_session(&self) -> SynthesisResult<Box<dyn SpeechSynthesizer>> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        let spec = self.specs[n.min(self.specs.len() - 1)].clone();
        Ok(Box::new(MockSession {
            spec,
            token_limit: self.token_limit,
            always_fail: self.always_fail,
            completions: self.completions.clone(),
            cancel_after: self.cancel_after,
            cancel_slot: self.cancel_slot.clone(),
            serialize: self.serialize.clone(),
        }))
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSession {
    async fn synthesize(
        &mut self,
        text: &str,
        _voice: &str,
        _language: Option<&str>,
    ) -> SynthesisResult<Vec<PcmBuffer>> {
        let _guard = match &self.serialize {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if self.always_fail {
            return Err(SynthesisError::Failed("model exploded".to_string()));
        }
        if let Some(limit) = self.token_limit {
            if text.chars().count() >= limit {
                return Err(SynthesisError::TokenLimitExceeded);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let frames = match self.spec.frames {
            FrameRule::Fixed(n) => n,
            FrameRule::PerChar(per) => text.chars().count() * per,
        };
        let samples = frames * self.spec.format.channels as usize;
        let data = match self.spec.format.sample_format {
            SampleFormat::Float32 => SampleData::Float32(vec![0.1; samples]),
            SampleFormat::Int16 => SampleData::Int16(vec![100; samples]),
        };

        let done = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(threshold) = self.cancel_after {
            if done == threshold {
                if let Some(flag) = self.cancel_slot.lock().as_ref() {
                    flag.cancel();
                }
            }
        }
        Ok(vec![PcmBuffer::new(self.spec.format, data)])
    }
}

// ---------------------------------------------------------------------------
// Encoder double

struct MockEncoder {
    tags: Mutex<Vec<ContainerTags>>,
}

impl MockEncoder {
    fn new() -> Self {
        MockEncoder {
            tags: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaEncoder for MockEncoder {
    async fn transcode(
        &self,
        master: &Path,
        output: &Path,
        _spec: TranscodeSpec,
    ) -> EncodeResult<()> {
        std::fs::copy(master, output).unwrap();
        Ok(())
    }

    async fn tag(&self, _container: &Path, tags: &ContainerTags) -> EncodeResult<()> {
        self.tags.lock().push(tags.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn options(output_dir: &Path, workers: usize, newline: NewlineMode) -> ConversionOptions {
    let mut tts = TtsConfig::new("v");
    tts.parallel_workers = workers;
    ConversionOptions {
        normalization: NormalizationConfig {
            newline_mode: newline,
            apply_footnote_cleanup: false,
            ..NormalizationConfig::default()
        },
        tts,
        output: OutputConfig {
            output_dir: output_dir.to_path_buf(),
            format: OutputFormat::M4b,
            bitrate_kbps: 96,
        },
    }
}

fn session_dir(output_dir: &Path) -> PathBuf {
    std::fs::read_dir(output_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("conversion_"))
        })
        .expect("session folder should exist")
}

fn chapter_files(session: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(session)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("chapter_") && n.ends_with(".wav"))
        .collect();
    names.sort();
    names
}

fn read_sidecar(path: &Path) -> Vec<ChapterMark> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn two_chapter_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("spoken.epub");
    EpubFixture::new("Spoken Words")
        .chapter("c1.xhtml", "<html><body><p>Hello.</p></body></html>")
        .chapter("c2.xhtml", "<html><body><p>World.</p></body></html>")
        .cover(PNG_MAGIC)
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let provider = Arc::new(MockProvider::fixed(AudioFormat::mono_float32(24_000), 24_000));
    let encoder = Arc::new(MockEncoder::new());
    let engine = ConversionEngine::new(
        provider,
        encoder.clone(),
        options(&out, 2, NewlineMode::None),
    );

    let artifact = engine.convert(&epub).await.unwrap();
    assert_eq!(engine.status(), ConversionStatus::Complete);
    assert_eq!(artifact.limit_hits, 0);
    assert!((artifact.duration - 2.0).abs() < 1e-6);
    assert_eq!(artifact.container.file_name().unwrap(), "Spoken Words.m4b");
    assert!(artifact.container.exists());

    let marks = read_sidecar(&artifact.sidecar);
    assert_eq!(marks.len(), 2);
    assert_eq!(marks[0].start, 0.0);
    assert!((marks[1].start - 1.0).abs() < 1e-6);
    assert_eq!(marks[0].title, "Hello.");
    assert_eq!(marks[1].title, "World.");

    let session = session_dir(&out);
    assert_eq!(session, artifact.session_dir);
    let chapters = chapter_files(&session);
    assert_eq!(chapters.len(), 2);
    assert!(chapters[0].starts_with("chapter_01_"));
    assert!(chapters[1].starts_with("chapter_02_"));
    // Master PCM is deleted after a successful transcode.
    assert!(!session.join("master.wav").exists());
    // The run transcript is preserved inside the session folder.
    let log = std::fs::read_to_string(session.join("conversion.log")).unwrap();
    assert!(log.contains("chapters"));
    assert!(log.contains("[complete]"));

    // Cover artwork was staged and handed to the encoder.
    let tags = encoder.tags.lock();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].title, "Spoken Words");
    assert_eq!(tags[0].artist, "Test Author");
    assert!(tags[0].artwork.as_ref().unwrap().ends_with("cover.png"));
    // Chapter markers were handed to the encoder alongside the tags.
    assert_eq!(tags[0].chapters.len(), 2);
    assert_eq!(tags[0].chapters[0].start, 0.0);
    assert!((tags[0].chapters[0].end - 1.0).abs() < 1e-6);
    assert!((tags[0].chapters[1].end - 2.0).abs() < 1e-6);
}

#[tokio::test]
async fn token_limit_bisections_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("long.epub");
    EpubFixture::new("Long Sentences")
        .chapter(
            "c1.xhtml",
            "<html><body><p>Sentence one. Sentence two? Sentence three!</p></body></html>",
        )
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let mut provider = MockProvider::per_char(AudioFormat::mono_int16(22_050), 100);
    provider.token_limit = Some(30);
    let engine = ConversionEngine::new(
        Arc::new(provider),
        Arc::new(MockEncoder::new()),
        options(&out, 1, NewlineMode::None),
    );

    let artifact = engine.convert(&epub).await.unwrap();
    assert_eq!(engine.status(), ConversionStatus::Complete);
    assert_eq!(artifact.limit_hits, 2);
    // Every character was synthesized exactly once.
    let text = "Sentence one. Sentence two? Sentence three!";
    let expected = text.chars().count() as f64 * 100.0 / 22_050.0;
    assert!((artifact.duration - expected).abs() < 1e-6);
}

#[tokio::test]
async fn heterogeneous_formats_unify_to_first_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("mixed.epub");
    EpubFixture::new("Mixed Formats")
        .chapter("c1.xhtml", "<html><body><p>First.</p></body></html>")
        .chapter("c2.xhtml", "<html><body><p>Second.</p></body></html>")
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let provider = MockProvider::with_specs(vec![
        SessionSpec {
            format: AudioFormat::mono_float32(24_000),
            frames: FrameRule::Fixed(24_000),
        },
        SessionSpec {
            format: AudioFormat::mono_int16(16_000),
            frames: FrameRule::Fixed(12_000),
        },
    ]);
    let engine = ConversionEngine::new(
        Arc::new(provider),
        Arc::new(MockEncoder::new()),
        // One worker so the session order matches the chapter order.
        options(&out, 1, NewlineMode::None),
    );

    let artifact = engine.convert(&epub).await.unwrap();
    // 1.0s at 24 kHz plus 0.75s resampled from 16 kHz.
    assert!((artifact.duration - 1.75).abs() < 1e-6);
    let marks = read_sidecar(&artifact.sidecar);
    assert!((marks[1].start - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn cancellation_preserves_partial_session() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("ten.epub");
    let chapter_html: Vec<String> = (0..10)
        .map(|i| format!("<html><body><p>Chapter text number {i}.</p></body></html>"))
        .collect();
    let hrefs: Vec<String> = (0..10).map(|i| format!("c{i}.xhtml")).collect();
    let mut fixture = EpubFixture::new("Ten Chapters");
    for i in 0..10 {
        fixture = fixture.chapter(&hrefs[i], &chapter_html[i]);
    }
    fixture.write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let mut provider = MockProvider::fixed(AudioFormat::mono_int16(8_000), 800);
    provider.cancel_after = Some(3);
    provider.serialize = Some(Arc::new(tokio::sync::Mutex::new(())));
    let cancel_slot = provider.cancel_slot.clone();
    let engine = ConversionEngine::new(
        Arc::new(provider),
        Arc::new(MockEncoder::new()),
        options(&out, 2, NewlineMode::None),
    );
    *cancel_slot.lock() = Some(engine.cancel_flag());

    let err = engine.convert(&epub).await.unwrap_err();
    assert!(matches!(err, ConversionError::Cancelled));
    assert_eq!(engine.status(), ConversionStatus::Cancelled);

    // The session folder survives with the chapters finished before the
    // cancel was observed.
    let session = session_dir(&out);
    let chapters = chapter_files(&session);
    assert!(
        (3..=4).contains(&chapters.len()),
        "expected 3 or 4 intermediates, found {chapters:?}"
    );

    // No final container, no sidecar.
    assert!(!out.join("chapters.json").exists());
    let containers: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |x| x == "m4b"))
        .collect();
    assert!(containers.is_empty());
}

#[tokio::test]
async fn synthesis_failure_aborts_but_keeps_session() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("bad.epub");
    EpubFixture::new("Doomed")
        .chapter("c1.xhtml", "<html><body><p>Some text.</p></body></html>")
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let mut provider = MockProvider::fixed(AudioFormat::mono_int16(8_000), 800);
    provider.always_fail = true;
    let engine = ConversionEngine::new(
        Arc::new(provider),
        Arc::new(MockEncoder::new()),
        options(&out, 1, NewlineMode::None),
    );

    let err = engine.convert(&epub).await.unwrap_err();
    assert!(matches!(err, ConversionError::SynthesisFailed(_)));
    assert_eq!(engine.status(), ConversionStatus::Failed);

    // The session folder is preserved for inspection; no container exists.
    let session = session_dir(&out);
    assert!(session.exists());
    assert!(!out.join("chapters.json").exists());
}

#[tokio::test]
async fn unknown_voice_is_rejected_before_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("voice.epub");
    EpubFixture::new("Voiceless")
        .chapter("c1.xhtml", "<html><body><p>Text.</p></body></html>")
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let provider = MockProvider::fixed(AudioFormat::mono_int16(8_000), 800);
    let mut opts = options(&out, 1, NewlineMode::None);
    opts.tts.voice = "nonexistent".to_string();
    let engine = ConversionEngine::new(Arc::new(provider), Arc::new(MockEncoder::new()), opts);

    let err = engine.convert(&epub).await.unwrap_err();
    match err {
        ConversionError::SynthesisFailed(msg) => assert!(msg.contains("nonexistent")),
        other => panic!("expected SynthesisFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn progress_reaches_completion_and_carries_log() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("progress.epub");
    EpubFixture::new("Progressive")
        .chapter("c1.xhtml", "<html><body><p>One.</p></body></html>")
        .chapter("c2.xhtml", "<html><body><p>Two.</p></body></html>")
        .write(&epub);

    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let provider = MockProvider::fixed(AudioFormat::mono_int16(16_000), 1_600);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = ConversionEngine::new(
        Arc::new(provider),
        Arc::new(MockEncoder::new()),
        options(&out, 2, NewlineMode::None),
    )
    .with_progress(tx);

    engine.convert(&epub).await.unwrap();

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert!(updates
        .iter()
        .any(|u| u.status == ConversionStatus::Parsing));
    assert!(updates
        .iter()
        .any(|u| u.status == ConversionStatus::Synthesizing));
    let last = updates.last().unwrap();
    assert_eq!(last.status, ConversionStatus::Complete);
    assert_eq!(last.fraction, 1.0);
    // Fractions never go backwards during synthesis.
    let synth: Vec<f32> = updates
        .iter()
        .filter(|u| u.status == ConversionStatus::Synthesizing)
        .map(|u| u.fraction)
        .collect();
    assert!(synth.windows(2).all(|w| w[0] <= w[1]));
    // The session log rode along on the channel.
    assert!(updates.iter().any(|u| !u.log_entries.is_empty()));
}
