/// Conversion Engine
///
/// Orchestrates the pipeline: Parsing -> Normalizing -> Synthesizing ->
/// Assembling, ending in Complete, Cancelled or Failed. Progress and an
/// ordered session log stream out over an optional channel; cancellation is
/// a single idempotent flag observed at every stage boundary, before each
/// worker dispatch and before each chunk written during assembly.
///
/// Each run owns a session folder `conversion_<uuid>` under the output
/// directory. It holds the per-chapter intermediates and survives success,
/// failure and cancellation alike; deletion is an explicit user request.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConversionOptions;
use crate::error::{ConversionError, Result};
use crate::models::{
    AudiobookArtifact, Book, CancelFlag, ConversionSession, ConversionStatus, NormalizedChapter,
    ProgressUpdate,
};
use crate::services::audio_assembler::AudioAssembler;
use crate::services::epub_reader::EpubReader;
use crate::services::media_encoder::MediaEncoder;
use crate::services::synthesis_scheduler::SynthesisScheduler;
use crate::services::text_normalizer::{self, CompiledRules};
use crate::services::tts_adapter::SynthesizerProvider;
use crate::utils::cover_extension;

struct EngineState {
    status: ConversionStatus,
    fraction: f32,
    pending_log: Vec<String>,
    full_log: Vec<String>,
    session_dir: Option<PathBuf>,
}

pub struct ConversionEngine {
    provider: Arc<dyn SynthesizerProvider>,
    encoder: Arc<dyn MediaEncoder>,
    options: ConversionOptions,
    cancel: CancelFlag,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    state: Mutex<EngineState>,
}

impl ConversionEngine {
    pub fn new(
        provider: Arc<dyn SynthesizerProvider>,
        encoder: Arc<dyn MediaEncoder>,
        options: ConversionOptions,
    ) -> Self {
        ConversionEngine {
            provider,
            encoder,
            options,
            cancel: CancelFlag::new(),
            progress: None,
            state: Mutex::new(EngineState {
                status: ConversionStatus::Idle,
                fraction: 0.0,
                pending_log: Vec::new(),
                full_log: Vec::new(),
                session_dir: None,
            }),
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Handle for external cancellation (UI, Ctrl-C). Idempotent.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn status(&self) -> ConversionStatus {
        self.state.lock().status
    }

    /// Run a full conversion. The terminal status surfaces the error kind;
    /// the session folder is preserved on every outcome.
    pub async fn convert(&self, epub_path: &Path) -> Result<AudiobookArtifact> {
        let result = self.run(epub_path).await;
        match &result {
            Ok(artifact) => {
                self.log(format!("Audiobook written to {}", artifact.container.display()));
                if artifact.limit_hits > 0 {
                    self.log(format!(
                        "Note: {} token-limit splits were needed during synthesis",
                        artifact.limit_hits
                    ));
                }
                self.transition(ConversionStatus::Complete, 1.0, "Conversion complete");
            }
            Err(ConversionError::Cancelled) => {
                let fraction = self.state.lock().fraction;
                self.transition(ConversionStatus::Cancelled, fraction, "Conversion cancelled");
            }
            Err(e) => {
                let fraction = self.state.lock().fraction;
                self.transition(ConversionStatus::Failed, fraction, &format!("{e}"));
            }
        }
        self.write_session_log();
        result
    }

    async fn run(&self, epub_path: &Path) -> Result<AudiobookArtifact> {
        // Parsing
        self.transition(
            ConversionStatus::Parsing,
            0.0,
            &format!("Parsing {}", epub_path.display()),
        );
        let book = EpubReader::read(epub_path)?;
        self.log(format!(
            "\"{}\" by {}: {} chapters",
            book.title,
            book.author,
            book.chapter_count()
        ));
        self.check_cancelled()?;

        let session = self.create_session()?;
        self.state.lock().session_dir = Some(session.dir.clone());
        self.log(format!("Session folder {}", session.dir.display()));

        // Normalizing
        self.transition(ConversionStatus::Normalizing, 0.0, "Normalizing chapters");
        let normalized = self.normalize(&book)?;
        self.check_cancelled()?;

        // Synthesizing
        self.transition(ConversionStatus::Synthesizing, 0.0, "Synthesizing speech");
        self.verify_voice().await?;
        let scheduler = SynthesisScheduler::new(
            self.provider.clone(),
            self.options.tts.clone(),
            self.cancel.clone(),
        );
        let mut assembler = AudioAssembler::new(&session.dir, self.cancel.clone());
        let total = normalized.len();

        let mut rx = scheduler.stream(normalized);
        let mut pending = BTreeMap::new();
        let mut next_index = 0usize;
        let mut completed = 0usize;
        let mut first_error: Option<ConversionError> = None;

        while let Some(result) = rx.recv().await {
            match result {
                Ok(audio) => {
                    completed += 1;
                    self.log(format!(
                        "Chapter {}/{} \"{}\" synthesized ({:.1}s)",
                        audio.index + 1,
                        total,
                        audio.title,
                        audio.duration
                    ));
                    pending.insert(audio.index, audio);
                    // Intermediates are written in index order so the first
                    // audible chapter locks the target format.
                    while let Some(ready) = pending.remove(&next_index) {
                        assembler.add_chapter(&ready)?;
                        next_index += 1;
                    }
                    self.transition(
                        ConversionStatus::Synthesizing,
                        completed as f32 / total.max(1) as f32,
                        &format!("Synthesized {completed}/{total} chapters"),
                    );
                }
                Err(ConversionError::Cancelled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        scheduler.stop();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        self.check_cancelled()?;

        let limit_hits = scheduler.limit_hits();
        if limit_hits > 0 {
            log::warn!("[Engine] {limit_hits} token-limit bisections during synthesis");
        }

        // Assembling
        let fraction = self.state.lock().fraction;
        self.transition(ConversionStatus::Assembling, fraction, "Assembling audiobook");
        let artwork = self.stage_artwork(&book, &session.dir);
        let mut artifact = assembler
            .finalize(&book, artwork, self.encoder.as_ref(), &self.options.output)
            .await?;
        artifact.limit_hits = limit_hits;
        Ok(artifact)
    }

    fn create_session(&self) -> Result<ConversionSession> {
        let id = Uuid::new_v4();
        let dir = self
            .options
            .output
            .output_dir
            .join(ConversionSession::folder_name(&id));
        std::fs::create_dir_all(&dir).map_err(|e| ConversionError::io(&dir, e))?;
        Ok(ConversionSession { id, dir })
    }

    fn normalize(&self, book: &Book) -> Result<Vec<NormalizedChapter>> {
        let config = &self.options.normalization;
        let rules = CompiledRules::compile(&config.search_replace_rules)?;
        let mut normalized = Vec::with_capacity(book.chapters.len());
        for chapter in &book.chapters {
            let text = text_normalizer::normalize_chapter(&chapter.html, config, &rules)?;
            let title = text_normalizer::chapter_title(chapter, &text, config.title_mode);
            log::debug!(
                "[Engine] chapter {:02} \"{}\": {} chars",
                chapter.index + 1,
                title,
                text.chars().count()
            );
            normalized.push(NormalizedChapter {
                index: chapter.index,
                title,
                text,
            });
        }
        Ok(normalized)
    }

    /// Capability discovery: the configured voice must exist before workers
    /// start spawning synthesis sessions.
    async fn verify_voice(&self) -> Result<()> {
        let voices = self
            .provider
            .voices()
            .await
            .map_err(ConversionError::from)?;
        let wanted = &self.options.tts.voice;
        match voices.iter().find(|v| &v.id == wanted) {
            Some(voice) => {
                self.log(format!(
                    "Voice {} ({}), native format {}",
                    voice.id,
                    voice.language.as_deref().unwrap_or("unknown language"),
                    voice.native_format
                ));
                Ok(())
            }
            None => Err(ConversionError::SynthesisFailed(format!(
                "voice {wanted} is not available"
            ))),
        }
    }

    fn stage_artwork(&self, book: &Book, session_dir: &Path) -> Option<PathBuf> {
        let cover = book.cover.as_ref()?;
        match cover_extension(cover) {
            Some(ext) => {
                let path = session_dir.join(format!("cover.{ext}"));
                match std::fs::write(&path, cover) {
                    Ok(()) => Some(path),
                    Err(e) => {
                        log::warn!("[Engine] could not stage cover artwork: {e}");
                        None
                    }
                }
            }
            None => {
                log::warn!("[Engine] cover bytes are not a recognizable image, skipping artwork");
                None
            }
        }
    }

    /// Persist the run transcript into the session folder so the preserved
    /// session explains itself.
    fn write_session_log(&self) {
        let state = self.state.lock();
        let Some(dir) = &state.session_dir else {
            return;
        };
        let path = dir.join("conversion.log");
        let mut contents = state.full_log.join("\n");
        contents.push('\n');
        if let Err(e) = std::fs::write(&path, contents) {
            log::warn!("[Engine] could not write session log: {e}");
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConversionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn log(&self, line: String) {
        log::info!("[Engine] {line}");
        let stamped = format!("{} {line}", chrono::Local::now().format("%H:%M:%S"));
        let mut state = self.state.lock();
        state.pending_log.push(stamped.clone());
        state.full_log.push(stamped);
    }

    fn transition(&self, status: ConversionStatus, fraction: f32, text: &str) {
        let update = {
            let mut state = self.state.lock();
            state.status = status;
            state.fraction = fraction.clamp(0.0, 1.0);
            state.full_log.push(format!(
                "{} [{status}] {text}",
                chrono::Local::now().format("%H:%M:%S")
            ));
            ProgressUpdate {
                fraction: state.fraction,
                status,
                status_text: text.to_string(),
                log_entries: std::mem::take(&mut state.pending_log),
            }
        };
        log::info!("[Engine] [{status}] {text}");
        if let Some(tx) = &self.progress {
            let _ = tx.send(update);
        }
    }
}

/// Explicit, user-initiated session cleanup. Refuses anything that is not a
/// `conversion_<uuid>` folder.
pub fn cleanup_session(dir: &Path) -> Result<()> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let is_session = name
        .strip_prefix("conversion_")
        .map_or(false, |suffix| Uuid::parse_str(suffix).is_ok());
    if !is_session {
        return Err(ConversionError::io(
            dir,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a conversion session folder",
            ),
        ));
    }
    std::fs::remove_dir_all(dir).map_err(|e| ConversionError::io(dir, e))?;
    log::info!("[Engine] removed session folder {}", dir.display());
    Ok(())
}
