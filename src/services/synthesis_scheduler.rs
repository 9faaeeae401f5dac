/// Synthesis Scheduler
///
/// Bounded-parallel dispatch of chapters to the TTS adapter. Worker count is
/// `max(1, min(CPU, chapters, user cap, 8))`; chapters are dispatched in
/// index order behind a semaphore and results stream back as they complete.
/// A `TokenLimitExceeded` from the adapter is recovered locally by bisecting
/// the input near sentence boundaries and concatenating the halves in order.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};

use crate::config::TtsConfig;
use crate::error::{ConversionError, Result};
use crate::models::{CancelFlag, ChapterAudio, NormalizedChapter, PcmBuffer};
use crate::services::tts_adapter::{SpeechSynthesizer, SynthesisError, SynthesizerProvider};

const SPLIT_BOUNDARIES: [char; 4] = ['.', '!', '?', '\n'];

pub struct SynthesisScheduler {
    provider: Arc<dyn SynthesizerProvider>,
    config: TtsConfig,
    cancel: CancelFlag,
    /// Set on the first worker failure so remaining workers stand down.
    stop: CancelFlag,
    limit_hits: Arc<AtomicUsize>,
}

impl SynthesisScheduler {
    pub fn new(provider: Arc<dyn SynthesizerProvider>, config: TtsConfig, cancel: CancelFlag) -> Self {
        SynthesisScheduler {
            provider,
            config,
            cancel,
            stop: CancelFlag::new(),
            limit_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token-limit bisections observed so far. Only meaningful after all
    /// workers have finished.
    pub fn limit_hits(&self) -> usize {
        self.limit_hits.load(Ordering::Relaxed)
    }

    /// Abort outstanding work after a failure elsewhere in the run.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Dispatch all chapters and stream per-chapter results in completion
    /// order. The channel closes once every worker is done.
    pub fn stream(
        &self,
        chapters: Vec<NormalizedChapter>,
    ) -> mpsc::UnboundedReceiver<Result<ChapterAudio>> {
        let workers = self.config.effective_workers(chapters.len());
        log::info!(
            "[Scheduler] dispatching {} chapters across {} workers",
            chapters.len(),
            workers
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(workers));

        for chapter in chapters {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let voice = self.config.voice.clone();
            let language = self.config.language.clone();
            let cancel = self.cancel.clone();
            let stop = self.stop.clone();
            let hits = self.limit_hits.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = synthesize_chapter(
                    provider.as_ref(),
                    &chapter,
                    &voice,
                    language.as_deref(),
                    &cancel,
                    &stop,
                    &hits,
                )
                .await;
                let _ = tx.send(result);
            });
        }

        rx
    }

    /// Run to completion: the full mapping of chapter index to synthesized
    /// audio, sorted by index. Cancellation yields `Cancelled` with no
    /// partial results; any chapter failure aborts the whole run.
    pub async fn run(&self, chapters: Vec<NormalizedChapter>) -> Result<Vec<ChapterAudio>> {
        let mut rx = self.stream(chapters);
        let mut completed = Vec::new();
        let mut first_error: Option<ConversionError> = None;

        while let Some(result) = rx.recv().await {
            match result {
                Ok(audio) => completed.push(audio),
                Err(ConversionError::Cancelled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        self.stop();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }
        completed.sort_by_key(|c| c.index);
        Ok(completed)
    }
}

async fn synthesize_chapter(
    provider: &dyn SynthesizerProvider,
    chapter: &NormalizedChapter,
    voice: &str,
    language: Option<&str>,
    cancel: &CancelFlag,
    stop: &CancelFlag,
    hits: &AtomicUsize,
) -> Result<ChapterAudio> {
    if cancel.is_cancelled() || stop.is_cancelled() {
        return Err(ConversionError::Cancelled);
    }

    let buffers = if chapter.text.trim().is_empty() {
        log::debug!("[Scheduler] chapter {} has no text, skipping", chapter.index);
        Vec::new()
    } else {
        // One adapter session per worker task; the model is never shared.
        let mut session = provider
            .create_session()
            .await
            .map_err(ConversionError::from)?;
        synthesize_with_fallback(
            session.as_mut(),
            &chapter.text,
            voice,
            language,
            cancel,
            stop,
            hits,
        )
        .await?
    };

    let duration = buffers.iter().map(PcmBuffer::duration_seconds).sum();
    log::debug!(
        "[Scheduler] chapter {} done: {} buffers, {:.2}s",
        chapter.index,
        buffers.len(),
        duration
    );

    Ok(ChapterAudio {
        index: chapter.index,
        title: chapter.title.clone(),
        buffers,
        duration,
    })
}

/// Synthesize `text`, bisecting on token overflow. Buffer order is the
/// in-order traversal of the bisection tree, so concatenation reproduces the
/// input order exactly.
fn synthesize_with_fallback<'a>(
    session: &'a mut dyn SpeechSynthesizer,
    text: &'a str,
    voice: &'a str,
    language: Option<&'a str>,
    cancel: &'a CancelFlag,
    stop: &'a CancelFlag,
    hits: &'a AtomicUsize,
) -> BoxFuture<'a, Result<Vec<PcmBuffer>>> {
    Box::pin(async move {
        if cancel.is_cancelled() || stop.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match session.synthesize(text, voice, language).await {
            Ok(buffers) => Ok(buffers),
            Err(SynthesisError::TokenLimitExceeded) => {
                if text.chars().count() <= 1 {
                    // Cannot split further; a one-character overflow is a
                    // hard failure.
                    return Err(ConversionError::SynthesisFailed(
                        "token limit exceeded for a single character".to_string(),
                    ));
                }
                hits.fetch_add(1, Ordering::Relaxed);
                let (left, right) = split_text(text);
                log::debug!(
                    "[Scheduler] token overflow, bisecting {} chars into {} + {}",
                    text.chars().count(),
                    left.chars().count(),
                    right.chars().count()
                );
                let mut buffers = synthesize_with_fallback(
                    &mut *session,
                    &left,
                    voice,
                    language,
                    cancel,
                    stop,
                    hits,
                )
                .await?;
                let mut rest = synthesize_with_fallback(
                    &mut *session,
                    &right,
                    voice,
                    language,
                    cancel,
                    stop,
                    hits,
                )
                .await?;
                buffers.append(&mut rest);
                Ok(buffers)
            }
            Err(e) => Err(e.into()),
        }
    })
}

/// Find a split near the middle: prefer a sentence boundary left of the
/// midpoint, then one to the right, then a plain character split. Both
/// halves always keep at least one character.
pub fn split_text(text: &str) -> (String, String) {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len < 2 {
        return (text.to_string(), String::new());
    }
    let mid = len / 2;

    let mut split = None;
    for i in (0..=mid.min(len - 2)).rev() {
        if SPLIT_BOUNDARIES.contains(&chars[i]) {
            split = Some(i + 1);
            break;
        }
    }
    if split.is_none() {
        for i in (mid + 1)..(len - 1) {
            if SPLIT_BOUNDARIES.contains(&chars[i]) {
                split = Some(i + 1);
                break;
            }
        }
    }
    let split = split.unwrap_or_else(|| mid.max(1));

    let (left, right) = chars.split_at(split);
    let left: String = left.iter().collect();
    let right: String = right.iter().collect();
    if left.trim().is_empty() || right.trim().is_empty() {
        // Boundary split produced a silent half: fall back to a strict
        // midpoint character split.
        let strict = mid.clamp(1, len - 1);
        let (l, r) = chars.split_at(strict);
        return (l.iter().collect(), r.iter().collect());
    }
    (left, right)
}
