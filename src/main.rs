use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use roudoku::config::{
    ConversionOptions, NewlineMode, NormalizationConfig, OutputConfig, OutputFormat,
    SearchReplaceRule, TitleMode, TtsConfig,
};
use roudoku::error::ConversionError;
use roudoku::models::{AudiobookArtifact, ProgressUpdate};
use roudoku::services::media_encoder::{FfmpegEncoder, MediaEncoder};
use roudoku::services::tts_adapter::{PiperProvider, SynthesizerProvider};
use roudoku::{cleanup_session, ConversionEngine};

#[derive(Parser)]
#[command(name = "roudoku", version)]
#[command(about = "Convert EPUB books into narrated audiobooks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an EPUB into an audiobook
    Convert(ConvertArgs),

    /// List the voices the synthesizer offers
    Voices(VoicesArgs),

    /// Remove a preserved conversion session folder
    Clean {
        /// The conversion_<uuid> folder to delete
        session_dir: PathBuf,
    },
}

#[derive(Args)]
struct ConvertArgs {
    /// Path to the EPUB file
    epub: PathBuf,

    /// Output directory (default: alongside the EPUB)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Voice identifier, see `roudoku voices`
    #[arg(long, required_unless_present = "options_file")]
    voice: Option<String>,

    /// Language tag handed to the synthesizer
    #[arg(long)]
    language: Option<String>,

    /// Final container format
    #[arg(long, value_enum, default_value_t = FormatArg::M4b)]
    format: FormatArg,

    /// Encoder bitrate in kbit/s
    #[arg(long, default_value_t = 96)]
    bitrate: u32,

    /// Number of parallel synthesis workers (1-8)
    #[arg(short = 'j', long, value_parser = clap::value_parser!(u8).range(1..=8))]
    workers: Option<u8>,

    /// Newline handling; `double` keeps paragraph breaks and turns an
    /// isolated newline (soft wrap) into a single space
    #[arg(long, value_enum, default_value_t = NewlineArg::Double)]
    newline_mode: NewlineArg,

    /// Text inserted where newlines collapse
    #[arg(long, default_value = "\n\n")]
    break_string: String,

    /// Keep superscript/bracketed footnote references in the text
    #[arg(long)]
    no_footnote_cleanup: bool,

    /// Chapter title heuristic
    #[arg(long, value_enum, default_value_t = TitleArg::Auto)]
    title_mode: TitleArg,

    /// Search/replace rule PATTERN=REPLACEMENT, repeatable, applied in order
    #[arg(long)]
    rule: Vec<String>,

    /// JSON file with search/replace rules
    #[arg(long)]
    rules_file: Option<PathBuf>,

    /// JSON file with the full conversion options; individual flags for
    /// voice and output directory still override it
    #[arg(long)]
    options_file: Option<PathBuf>,

    /// Directory containing the synthesizer voice models
    #[arg(long)]
    voices_dir: PathBuf,

    /// Synthesizer binary (default: piper on PATH)
    #[arg(long)]
    tts_bin: Option<PathBuf>,

    /// Encoder binary (default: ffmpeg on PATH)
    #[arg(long)]
    encoder_bin: Option<PathBuf>,
}

#[derive(Args)]
struct VoicesArgs {
    /// Directory containing the synthesizer voice models
    #[arg(long)]
    voices_dir: PathBuf,

    /// Synthesizer binary (default: piper on PATH)
    #[arg(long)]
    tts_bin: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    M4b,
    Mp3,
}

impl From<FormatArg> for OutputFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::M4b => OutputFormat::M4b,
            FormatArg::Mp3 => OutputFormat::Mp3,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NewlineArg {
    Single,
    Double,
    None,
}

impl From<NewlineArg> for NewlineMode {
    fn from(m: NewlineArg) -> Self {
        match m {
            NewlineArg::Single => NewlineMode::Single,
            NewlineArg::Double => NewlineMode::Double,
            NewlineArg::None => NewlineMode::None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TitleArg {
    Auto,
    TagText,
    FirstFew,
}

impl From<TitleArg> for TitleMode {
    fn from(m: TitleArg) -> Self {
        match m {
            TitleArg::Auto => TitleMode::Auto,
            TitleArg::TagText => TitleMode::TagText,
            TitleArg::FirstFew => TitleMode::FirstFew,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let code = match cli.command {
        Commands::Convert(args) => run_convert(args).await,
        Commands::Voices(args) => run_voices(args).await,
        Commands::Clean { session_dir } => match cleanup_session(&session_dir) {
            Ok(()) => {
                eprintln!("Removed {}", session_dir.display());
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                1
            }
        },
    };
    std::process::exit(code);
}

async fn run_convert(args: ConvertArgs) -> i32 {
    match convert(args).await {
        Ok(artifact) => {
            println!("{}", artifact.container.display());
            0
        }
        Err(e) => match e.downcast_ref::<ConversionError>() {
            Some(ConversionError::Cancelled) => {
                eprintln!("cancelled");
                130
            }
            _ => {
                eprintln!("error: {e:#}");
                1
            }
        },
    }
}

async fn convert(args: ConvertArgs) -> anyhow::Result<AudiobookArtifact> {
    if !args.epub.exists() {
        anyhow::bail!("EPUB file not found: {}", args.epub.display());
    }
    let output_dir = args.output_dir.clone().unwrap_or_else(|| {
        args.epub
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let options = if let Some(path) = &args.options_file {
        let mut options = ConversionOptions::load(path)
            .with_context(|| format!("cannot load options file {}", path.display()))?;
        if args.output_dir.is_some() {
            options.output.output_dir = output_dir;
        }
        if let Some(voice) = &args.voice {
            options.tts.voice = voice.clone();
        }
        options
    } else {
        let mut rules = Vec::new();
        if let Some(path) = &args.rules_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read rules file {}", path.display()))?;
            let from_file: Vec<SearchReplaceRule> = serde_json::from_slice(&bytes)
                .with_context(|| format!("invalid rules file {}", path.display()))?;
            rules.extend(from_file);
        }
        for raw in &args.rule {
            let (pattern, replacement) = raw
                .split_once('=')
                .with_context(|| format!("rule {raw:?} is not PATTERN=REPLACEMENT"))?;
            rules.push(SearchReplaceRule {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
                case_insensitive: false,
            });
        }

        let mut tts = TtsConfig::new(args.voice.clone().expect("voice is required"));
        tts.language = args.language.clone();
        if let Some(workers) = args.workers {
            tts.parallel_workers = workers as usize;
        }

        ConversionOptions {
            normalization: NormalizationConfig {
                title_mode: args.title_mode.into(),
                newline_mode: args.newline_mode.into(),
                break_string: args.break_string.clone(),
                apply_footnote_cleanup: !args.no_footnote_cleanup,
                search_replace_rules: rules,
            },
            tts,
            output: OutputConfig {
                output_dir,
                format: args.format.into(),
                bitrate_kbps: args.bitrate,
            },
        }
    };

    let provider: Arc<dyn SynthesizerProvider> = Arc::new(
        PiperProvider::new(&args.voices_dir, args.tts_bin.clone())
            .context("cannot set up the synthesizer")?,
    );
    let encoder: Arc<dyn MediaEncoder> = Arc::new(match args.encoder_bin.clone() {
        Some(binary) => FfmpegEncoder::with_binary(binary),
        None => FfmpegEncoder::discover().context("cannot set up the encoder")?,
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let progress = ProgressBar::new(100);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {percent}% {msg}")
            .expect("static progress template")
            .progress_chars("#>-"),
    );
    let printer = tokio::spawn({
        let progress = progress.clone();
        async move {
            while let Some(update) = rx.recv().await {
                for line in &update.log_entries {
                    progress.println(format!("  {line}"));
                }
                progress.set_position((update.fraction * 100.0) as u64);
                progress.set_message(update.status_text.clone());
            }
        }
    });

    let engine = ConversionEngine::new(provider, encoder, options).with_progress(tx);
    let cancel = engine.cancel_flag();
    ctrlc::set_handler(move || {
        eprintln!("cancelling, waiting for workers to stop...");
        cancel.cancel();
    })
    .context("failed to install the Ctrl-C handler")?;

    let result = engine.convert(&args.epub).await;
    drop(engine);
    let _ = printer.await;
    progress.finish_and_clear();
    Ok(result?)
}

async fn run_voices(args: VoicesArgs) -> i32 {
    let provider = match PiperProvider::new(&args.voices_dir, args.tts_bin) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    match provider.voices().await {
        Ok(voices) if voices.is_empty() => {
            eprintln!("No voices found in {}", args.voices_dir.display());
            1
        }
        Ok(voices) => {
            for voice in voices {
                println!(
                    "{:<40} {:<8} {}",
                    voice.id,
                    voice.language.as_deref().unwrap_or("-"),
                    voice.native_format
                );
            }
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
