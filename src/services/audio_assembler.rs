/// Audio Assembler
///
/// Takes per-chapter PCM buffer sequences in spine order and produces the
/// final audiobook: one intermediate RIFF file per chapter, a master PCM
/// stream concatenated in bounded chunks, a transcode to the compressed
/// container with embedded tags, and a `chapters.json` sidecar.
///
/// The format of the first buffer seen becomes the target format; every
/// later buffer is converted to it. A conversion that fails is logged and
/// the original buffer is used best-effort, never aborting the run.
use std::path::{Path, PathBuf};

use crate::config::OutputConfig;
use crate::error::{ConversionError, Result};
use crate::models::{
    AudioFormat, AudiobookArtifact, Book, CancelFlag, ChapterAudio, ChapterMark, PcmBuffer,
    SampleData, SampleFormat,
};
use crate::services::media_encoder::{ChapterSpan, ContainerTags, MediaEncoder, TranscodeSpec};
use crate::services::wav::{WavReader, WavWriter};
use crate::utils::{sanitize_component, unique_destination};

/// Frames moved per read during master assembly.
const APPEND_CHUNK_FRAMES: usize = 8192;

/// Extra output frames allowed for on top of the resample ratio estimate.
const RESAMPLE_SLACK: usize = 16;

const MASTER_FILE: &str = "master.wav";
const SIDECAR_FILE: &str = "chapters.json";

/// One written chapter intermediate.
#[derive(Debug, Clone)]
pub struct ChapterTrack {
    pub index: usize,
    pub title: String,
    pub path: PathBuf,
    pub frames: u64,
    /// Seconds from audiobook start; filled during master assembly.
    pub start: f64,
}

pub struct AudioAssembler {
    session_dir: PathBuf,
    cancel: CancelFlag,
    target: Option<AudioFormat>,
    tracks: Vec<ChapterTrack>,
}

impl AudioAssembler {
    pub fn new(session_dir: impl Into<PathBuf>, cancel: CancelFlag) -> Self {
        AudioAssembler {
            session_dir: session_dir.into(),
            cancel,
            target: None,
            tracks: Vec::new(),
        }
    }

    /// Target format, once the first buffer has locked it.
    pub fn target_format(&self) -> Option<AudioFormat> {
        self.target
    }

    pub fn tracks(&self) -> &[ChapterTrack] {
        &self.tracks
    }

    /// Write one chapter's intermediate file. Chapters must arrive in index
    /// order; the first buffer of the first audible chapter fixes the target
    /// format for the rest of the conversion.
    pub fn add_chapter(&mut self, audio: &ChapterAudio) -> Result<&ChapterTrack> {
        if self.target.is_none() {
            if let Some(first) = audio.buffers.first() {
                log::info!("[Assembler] target format locked to {}", first.format);
                self.target = Some(first.format);
            }
        }
        // A silent chapter before any audio locks the target still needs a
        // structurally valid intermediate; the placeholder layout carries
        // zero frames.
        let target = self.target.unwrap_or(AudioFormat::mono_int16(22_050));

        let file_name = format!(
            "chapter_{:02}_{}.wav",
            audio.index + 1,
            nonempty(sanitize_component(&audio.title), "untitled")
        );
        let path = self.session_dir.join(file_name);

        let mut writer = WavWriter::create(&path, target)?;
        for buffer in &audio.buffers {
            let aligned = align_buffer(buffer, target);
            writer.write_samples(&aligned.data)?;
        }
        let frames = writer.finalize()?;

        log::debug!(
            "[Assembler] chapter {:02} -> {} ({} frames)",
            audio.index + 1,
            path.display(),
            frames
        );
        self.tracks.push(ChapterTrack {
            index: audio.index,
            title: audio.title.clone(),
            path,
            frames,
            start: 0.0,
        });
        Ok(self.tracks.last().expect("track just pushed"))
    }

    /// Concatenate all intermediates into the master stream, transcode, tag,
    /// move the container into place and write the sidecar.
    pub async fn finalize(
        &mut self,
        book: &Book,
        artwork: Option<PathBuf>,
        encoder: &dyn MediaEncoder,
        output: &OutputConfig,
    ) -> Result<AudiobookArtifact> {
        let target = self.target.ok_or_else(|| {
            ConversionError::SynthesisFailed("no audio buffers were produced".to_string())
        })?;
        self.tracks.sort_by_key(|t| t.index);

        let master_path = self.session_dir.join(MASTER_FILE);
        let mut master = WavWriter::create(&master_path, target)?;

        for track in &mut self.tracks {
            track.start = master.frames_written() as f64 / target.sample_rate as f64;
            let mut reader = WavReader::open(&track.path)?;
            let source_format = reader.format();
            let mut warned = false;
            while let Some(chunk) = reader.read_chunk(APPEND_CHUNK_FRAMES)? {
                if self.cancel.is_cancelled() {
                    return Err(ConversionError::Cancelled);
                }
                let aligned = if source_format == target {
                    chunk
                } else {
                    if !warned {
                        log::warn!(
                            "[Assembler] {} is {} instead of target {}; converting during append",
                            track.path.display(),
                            source_format,
                            target
                        );
                        warned = true;
                    }
                    align_buffer(&chunk, target)
                };
                master.write_samples(&aligned.data)?;
            }
        }

        let master_frames = master.finalize()?;
        let duration = master_frames as f64 / target.sample_rate as f64;
        log::info!(
            "[Assembler] master stream: {} frames, {:.1}s",
            master_frames,
            duration
        );

        if self.cancel.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }

        let stem = nonempty(sanitize_component(&book.title), "audiobook");
        let ext = output.format.extension();
        let staged = self.session_dir.join(format!("{stem}.{ext}"));

        // Transcode failures keep the master file around for diagnostics.
        encoder
            .transcode(
                &master_path,
                &staged,
                TranscodeSpec {
                    format: output.format,
                    bitrate_kbps: output.bitrate_kbps,
                },
            )
            .await?;
        encoder
            .tag(
                &staged,
                &ContainerTags {
                    title: book.title.clone(),
                    artist: book.author.clone(),
                    artwork,
                    chapters: self.chapter_spans(duration),
                },
            )
            .await?;

        if let Err(e) = std::fs::remove_file(&master_path) {
            log::warn!("[Assembler] could not remove master PCM: {e}");
        }

        std::fs::create_dir_all(&output.output_dir)
            .map_err(|e| ConversionError::io(&output.output_dir, e))?;
        let destination = unique_destination(&output.output_dir, &stem, ext);
        std::fs::rename(&staged, &destination)
            .map_err(|e| ConversionError::io(&destination, e))?;

        let sidecar = destination
            .parent()
            .unwrap_or(Path::new("."))
            .join(SIDECAR_FILE);
        let marks: Vec<ChapterMark> = self
            .tracks
            .iter()
            .map(|t| ChapterMark {
                start: t.start,
                title: t.title.clone(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&marks)?;
        std::fs::write(&sidecar, json).map_err(|e| ConversionError::io(&sidecar, e))?;

        log::info!("[Assembler] wrote {}", destination.display());
        Ok(AudiobookArtifact {
            container: destination,
            sidecar,
            session_dir: self.session_dir.clone(),
            duration,
            limit_hits: 0,
        })
    }

    /// Chapter markers for the container: each span runs to the next
    /// chapter's start, the last one to the end of the stream.
    fn chapter_spans(&self, total_duration: f64) -> Vec<ChapterSpan> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(i, track)| ChapterSpan {
                title: track.title.clone(),
                start: track.start,
                end: self
                    .tracks
                    .get(i + 1)
                    .map(|next| next.start)
                    .unwrap_or(total_duration),
            })
            .collect()
    }
}

fn nonempty(s: String, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s
    }
}

/// Convert with the best-effort policy: a failed conversion logs a warning
/// and falls back to the original samples coerced into the target layout so
/// downstream writes stay structurally valid.
fn align_buffer(buffer: &PcmBuffer, target: AudioFormat) -> PcmBuffer {
    match convert_buffer(buffer, target) {
        Ok(converted) => converted,
        Err(e) => {
            log::warn!("[Assembler] {e}; using original buffer best-effort");
            let layout_only = AudioFormat {
                sample_rate: buffer.format.sample_rate.max(1),
                channels: buffer.format.channels.max(1),
                ..target
            };
            convert_buffer(buffer, layout_only).unwrap_or_else(|_| buffer.clone())
        }
    }
}

/// Sample-exact conversion between PCM layouts: interleave, channel mix,
/// linear resample, sample format. Fails only on degenerate descriptors.
pub fn convert_buffer(buffer: &PcmBuffer, target: AudioFormat) -> Result<PcmBuffer> {
    let source = buffer.format;
    if source.channels == 0 || target.channels == 0 {
        return Err(ConversionError::FormatConversionFailed(
            "zero channel count".to_string(),
        ));
    }
    if source.sample_rate == 0 || target.sample_rate == 0 {
        return Err(ConversionError::FormatConversionFailed(
            "zero sample rate".to_string(),
        ));
    }
    if buffer.format == target {
        return Ok(buffer.clone());
    }

    // Working copy: interleaved f32.
    let samples = to_f32(&buffer.data);
    let frames = samples.len() / source.channels as usize;
    let interleaved = if source.interleaved || source.channels == 1 {
        samples
    } else {
        interleave(&samples, frames, source.channels as usize)
    };

    // Channel mix: average the source channels, fan out to the target count.
    let mixed: Vec<f32> = if source.channels == target.channels {
        interleaved
    } else {
        let src_ch = source.channels as usize;
        let dst_ch = target.channels as usize;
        let mut out = Vec::with_capacity(frames * dst_ch);
        for frame in interleaved.chunks_exact(src_ch) {
            let mean = frame.iter().sum::<f32>() / src_ch as f32;
            for _ in 0..dst_ch {
                out.push(mean);
            }
        }
        out
    };

    // Linear resample.
    let resampled: Vec<f32> = if source.sample_rate == target.sample_rate {
        mixed
    } else {
        let dst_ch = target.channels as usize;
        let ratio = target.sample_rate as f64 / source.sample_rate as f64;
        let out_frames = (frames as f64 * ratio).round() as usize;
        let mut out = Vec::with_capacity(out_frames * dst_ch + RESAMPLE_SLACK);
        for i in 0..out_frames {
            let src_pos = i as f64 / ratio;
            let left = src_pos.floor() as usize;
            let right = (left + 1).min(frames.saturating_sub(1));
            let t = (src_pos - left as f64) as f32;
            for ch in 0..dst_ch {
                let a = mixed.get(left * dst_ch + ch).copied().unwrap_or(0.0);
                let b = mixed.get(right * dst_ch + ch).copied().unwrap_or(0.0);
                out.push(a + (b - a) * t);
            }
        }
        out
    };

    let final_samples = if target.interleaved || target.channels == 1 {
        resampled
    } else {
        deinterleave(&resampled, target.channels as usize)
    };

    let data = match target.sample_format {
        SampleFormat::Float32 => SampleData::Float32(final_samples),
        SampleFormat::Int16 => SampleData::Int16(
            final_samples
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
                .collect(),
        ),
    };
    Ok(PcmBuffer::new(target, data))
}

fn to_f32(data: &SampleData) -> Vec<f32> {
    match data {
        SampleData::Float32(v) => v.clone(),
        SampleData::Int16(v) => v.iter().map(|&s| s as f32 / -(i16::MIN as f32)).collect(),
    }
}

fn interleave(planar: &[f32], frames: usize, channels: usize) -> Vec<f32> {
    let mut out = vec![0.0; planar.len()];
    for ch in 0..channels {
        for frame in 0..frames {
            out[frame * channels + ch] = planar[ch * frames + frame];
        }
    }
    out
}

fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<f32> {
    let frames = interleaved.len() / channels;
    let mut out = vec![0.0; interleaved.len()];
    for frame in 0..frames {
        for ch in 0..channels {
            out[ch * frames + frame] = interleaved[frame * channels + ch];
        }
    }
    out
}
