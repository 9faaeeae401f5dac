/// Media Encoder
///
/// The compressed-container encoder as a `{transcode, tag}` capability set.
/// The pipeline never touches codec internals; it hands over the master PCM
/// file plus the metadata and gets a container back. The concrete default
/// shells out to ffmpeg, located via PATH; tests swap in a recording double
/// through the same trait.
///
/// Tagging embeds title, artist, optional artwork and the chapter markers.
/// Chapters ride in an FFMETADATA1 sidecar handed to ffmpeg with
/// `-map_metadata`, so M4B players see real chapter atoms in addition to the
/// JSON sidecar the assembler writes.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::OutputFormat;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Codec parameters for the transcode step.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeSpec {
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
}

/// One chapter marker inside the container.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterSpan {
    pub title: String,
    /// Seconds from container start.
    pub start: f64,
    pub end: f64,
}

/// Metadata embedded into the final container.
#[derive(Debug, Clone)]
pub struct ContainerTags {
    pub title: String,
    pub artist: String,
    pub artwork: Option<PathBuf>,
    pub chapters: Vec<ChapterSpan>,
}

#[async_trait]
pub trait MediaEncoder: Send + Sync {
    /// Transcode a PCM master file into a compressed container at `output`.
    async fn transcode(&self, master: &Path, output: &Path, spec: TranscodeSpec)
        -> EncodeResult<()>;

    /// Embed tags, artwork and chapter markers into an existing container.
    async fn tag(&self, container: &Path, tags: &ContainerTags) -> EncodeResult<()>;
}

/// Render tags and chapter spans as an FFMETADATA1 document.
pub fn format_ffmetadata(tags: &ContainerTags) -> String {
    let mut out = String::from(";FFMETADATA1\n");
    out.push_str(&format!("title={}\n", ffmeta_escape(&tags.title)));
    out.push_str(&format!("artist={}\n", ffmeta_escape(&tags.artist)));
    for span in &tags.chapters {
        out.push_str("[CHAPTER]\n");
        out.push_str("TIMEBASE=1/1000\n");
        out.push_str(&format!("START={}\n", (span.start * 1000.0).round() as u64));
        out.push_str(&format!("END={}\n", (span.end * 1000.0).round() as u64));
        out.push_str(&format!("title={}\n", ffmeta_escape(&span.title)));
    }
    out
}

/// FFMETADATA requires `=`, `;`, `#`, `\` and newlines to be escaped.
fn ffmeta_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Default encoder backed by the ffmpeg CLI.
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    pub fn discover() -> EncodeResult<Self> {
        let binary = which::which("ffmpeg")
            .map_err(|e| EncodeError::Unavailable(format!("ffmpeg not found on PATH: {e}")))?;
        Ok(FfmpegEncoder { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        FfmpegEncoder { binary }
    }

    async fn run(&self, args: &[std::ffi::OsString]) -> EncodeResult<()> {
        log::debug!("[Encoder] ffmpeg {:?}", args);
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| EncodeError::Failed(format!("failed to run ffmpeg: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(4).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(EncodeError::Failed(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                tail.join(" | ")
            )));
        }
        Ok(())
    }
}

fn os(args: &[&str]) -> Vec<std::ffi::OsString> {
    args.iter().map(Into::into).collect()
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn transcode(
        &self,
        master: &Path,
        output: &Path,
        spec: TranscodeSpec,
    ) -> EncodeResult<()> {
        let bitrate = format!("{}k", spec.bitrate_kbps);
        let mut args = os(&["-hide_banner", "-loglevel", "error", "-y", "-i"]);
        args.push(master.as_os_str().to_owned());
        match spec.format {
            OutputFormat::M4b => {
                args.extend(os(&["-vn", "-c:a", "aac", "-b:a", &bitrate]));
                args.extend(os(&["-movflags", "+faststart", "-f", "ipod"]));
            }
            OutputFormat::Mp3 => {
                args.extend(os(&["-vn", "-c:a", "libmp3lame", "-b:a", &bitrate]));
            }
        }
        args.push(output.as_os_str().to_owned());
        self.run(&args).await
    }

    async fn tag(&self, container: &Path, tags: &ContainerTags) -> EncodeResult<()> {
        let ext = container
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("m4b");
        let tagged = container.with_extension(format!("tagged.{ext}"));
        let metadata_file = container.with_extension("ffmeta");
        std::fs::write(&metadata_file, format_ffmetadata(tags))
            .map_err(|e| EncodeError::Failed(format!("cannot write metadata file: {e}")))?;

        let mut args = os(&["-hide_banner", "-loglevel", "error", "-y", "-i"]);
        args.push(container.as_os_str().to_owned());
        args.push("-i".into());
        args.push(metadata_file.as_os_str().to_owned());
        if let Some(artwork) = &tags.artwork {
            args.push("-i".into());
            args.push(artwork.as_os_str().to_owned());
            args.extend(os(&[
                "-map",
                "0:a",
                "-map",
                "2:v",
                "-c:a",
                "copy",
                "-c:v",
                "mjpeg",
                "-disposition:v:0",
                "attached_pic",
            ]));
        } else {
            args.extend(os(&["-map", "0:a", "-c", "copy"]));
        }
        args.extend(os(&["-map_metadata", "1", "-map_chapters", "1"]));
        if ext == "mp3" {
            args.extend(os(&["-id3v2_version", "3"]));
        }
        args.push(tagged.as_os_str().to_owned());

        let result = self.run(&args).await;
        let _ = std::fs::remove_file(&metadata_file);
        result?;

        tokio::fs::rename(&tagged, container)
            .await
            .map_err(|e| EncodeError::Failed(format!("failed to replace tagged container: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(chapters: Vec<ChapterSpan>) -> ContainerTags {
        ContainerTags {
            title: "A Book".to_string(),
            artist: "An Author".to_string(),
            artwork: None,
            chapters,
        }
    }

    #[test]
    fn test_ffmetadata_header_and_tags() {
        let meta = format_ffmetadata(&tags(vec![]));
        assert!(meta.starts_with(";FFMETADATA1\n"));
        assert!(meta.contains("title=A Book\n"));
        assert!(meta.contains("artist=An Author\n"));
        assert!(!meta.contains("[CHAPTER]"));
    }

    #[test]
    fn test_ffmetadata_chapter_spans() {
        let meta = format_ffmetadata(&tags(vec![
            ChapterSpan {
                title: "One".to_string(),
                start: 0.0,
                end: 61.25,
            },
            ChapterSpan {
                title: "Two".to_string(),
                start: 61.25,
                end: 100.0,
            },
        ]));
        let chapters: Vec<&str> = meta.matches("[CHAPTER]").collect();
        assert_eq!(chapters.len(), 2);
        assert!(meta.contains("START=0\n"));
        assert!(meta.contains("END=61250\n"));
        assert!(meta.contains("START=61250\n"));
        assert!(meta.contains("title=Two\n"));
    }

    #[test]
    fn test_ffmetadata_escaping() {
        let meta = format_ffmetadata(&tags(vec![ChapterSpan {
            title: "A = B; #1 \\ test".to_string(),
            start: 0.0,
            end: 1.0,
        }]));
        assert!(meta.contains(r"title=A \= B\; \#1 \\ test"));
    }
}
