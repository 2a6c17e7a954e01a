use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use maker_core::ports::{FfmpegProcessor, YtDlpDownloader};
use maker_core::{
    query, resolver, AliasRegistry, CancellationToken, ConfigOverrides, Context, DerivationKind, DeriveRequest,
    DownloadRequest, MakerConfig, RecordView,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "maker=info,maker_core=info";
const VERBOSE_LOG_FILTER: &str = "maker=debug,maker_core=debug";

#[derive(Parser)]
#[command(name = "maker", version, about = "Download media, keep it under short aliases, cut clips and audio from it")]
struct Cli {
    /// Config file (default: ./maker.toml when present)
    #[arg(long, global = true, env = "MAKER_CONFIG")]
    config: Option<PathBuf>,

    /// Where downloads and the registry live
    #[arg(long, global = true, env = "MAKER_DOWNLOADS_DIR")]
    downloads_dir: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long, global = true, env = "MAKER_YTDLP_BIN")]
    ytdlp_bin: Option<String>,

    /// ffmpeg executable
    #[arg(long, global = true, env = "MAKER_FFMPEG_BIN")]
    ffmpeg_bin: Option<String>,

    /// ffprobe executable
    #[arg(long, global = true, env = "MAKER_FFPROBE_BIN")]
    ffprobe_bin: Option<String>,

    /// Parallel playlist downloads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Machine-readable output on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a URL and register it under an alias
    Download {
        url: String,

        /// Alias to register under (default: derived from the title)
        #[arg(long = "id")]
        alias: Option<String>,

        /// yt-dlp format selector
        #[arg(long)]
        format: Option<String>,

        /// Treat the URL as a playlist, one alias per item
        #[arg(long)]
        playlist: bool,

        /// Replace an alias bound to a different source
        #[arg(long)]
        overwrite: bool,
    },

    /// Cut a video or GIF clip
    Clip {
        #[command(flatten)]
        range: RangeArgs,

        /// mp4, mkv, webm or gif
        #[arg(long, default_value = "mp4")]
        fmt: String,

        /// Accept a source without an audio stream
        #[arg(long)]
        allow_no_audio: bool,
    },

    /// Extract audio
    Audio {
        #[command(flatten)]
        range: RangeArgs,

        /// m4a, wav or mp3
        #[arg(long, default_value = "m4a")]
        fmt: String,
    },

    /// Show what is known about an alias, URL or file
    Info {
        #[arg(long)]
        src: String,

        /// Use stored data only
        #[arg(long)]
        no_probe: bool,
    },

    /// List registered aliases, oldest first
    List,

    /// Remove an alias from the registry
    Remove {
        alias: String,

        /// Also delete the downloaded files
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Args)]
struct RangeArgs {
    /// Alias, URL or local file
    #[arg(long)]
    src: String,

    /// Start time: seconds or [HH:]MM:SS[.fff]
    #[arg(long)]
    start: String,

    /// End time (default: end of the media)
    #[arg(long)]
    end: Option<String>,

    /// Output directory (default: clips_dir or audio_dir from config)
    #[arg(long)]
    out: Option<PathBuf>,

    /// yt-dlp format selector if the source must be downloaded
    #[arg(long)]
    source_format: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let verbose = cli.verbose;

    let code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            report(&err, verbose);
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_env("MAKER_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<maker_core::Error>()
        .map(|e| e.category().exit_code())
        .unwrap_or(1)
}

fn report(err: &anyhow::Error, verbose: bool) {
    eprintln!("error: {err:#}");
    if let Some(maker_core::Error::Processing { stderr: Some(stderr), .. }) = err.downcast_ref::<maker_core::Error>() {
        if verbose {
            eprintln!("--- tool output ---\n{}", stderr.trim_end());
        } else {
            eprintln!("(run with -v to see the full tool output)");
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        downloads_dir: cli.downloads_dir,
        ytdlp_bin: cli.ytdlp_bin,
        ffmpeg_bin: cli.ffmpeg_bin,
        ffprobe_bin: cli.ffprobe_bin,
        workers: cli.workers,
    };
    let config = MakerConfig::load(cli.config.as_deref(), overrides)?;
    debug!(?config, "configuration");

    let downloader = YtDlpDownloader::new(&config.ytdlp_bin).with_timeout(config.tool_timeout());
    let processor = FfmpegProcessor::new(&config.ffmpeg_bin, &config.ffprobe_bin).with_timeout(config.tool_timeout());

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping...");
        handler_token.cancel();
    })
    .context("installing interrupt handler")?;

    let bar = ProgressBar::hidden();
    if let Ok(style) = ProgressStyle::with_template("[{bar:40}] {pos}/{len} {msg}") {
        bar.set_style(style);
    }
    let show_progress = !cli.json;
    let on_progress = |stage: &str, current: u64, total: u64, message: &str| {
        if show_progress && bar.is_hidden() {
            bar.set_draw_target(ProgressDrawTarget::stderr());
        }
        bar.set_length(total);
        bar.set_position(current + 1);
        bar.set_message(format!("{stage} {message}"));
    };

    let ctx = Context::new(&config, &downloader, &processor)
        .with_cancel_token(cancel)
        .with_progress(&on_progress);
    let mut registry = AliasRegistry::open(&config.downloads_dir)?;

    let result = execute(cli.command, cli.json, &ctx, &mut registry);
    bar.finish_and_clear();
    result
}

fn execute(command: Command, json: bool, ctx: &Context<'_>, registry: &mut AliasRegistry) -> anyhow::Result<()> {
    let downloads_dir = &ctx.config.downloads_dir;

    match command {
        Command::Download {
            url,
            alias,
            format,
            playlist,
            overwrite,
        } => {
            let request = DownloadRequest {
                reference: &url,
                alias: alias.as_deref(),
                format: format.as_deref(),
                playlist,
                overwrite,
            };
            let outcome = resolver::download(ctx, registry, &request)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            for alias in &outcome.aliases {
                match registry.get(alias) {
                    Some(record) => println!("{}", RecordView::new(record, downloads_dir)),
                    None => println!("{alias}"),
                }
            }
            for failure in &outcome.failures {
                let index = failure.index.map(|i| format!("#{i} ")).unwrap_or_default();
                eprintln!("failed {}{}: {}", index, failure.url, failure.error);
            }
            if !outcome.failures.is_empty() {
                eprintln!(
                    "{} downloaded, {} failed",
                    outcome.aliases.len(),
                    outcome.failures.len()
                );
            }
        }

        Command::Clip {
            range,
            fmt,
            allow_no_audio,
        } => {
            let mut request = derive_request(DerivationKind::Clip, &range, &fmt);
            request.allow_no_audio = allow_no_audio;
            print_artifact(maker_core::derive::derive(ctx, registry, &request)?, json)?;
        }

        Command::Audio { range, fmt } => {
            let request = derive_request(DerivationKind::Audio, &range, &fmt);
            print_artifact(maker_core::derive::derive(ctx, registry, &request)?, json)?;
        }

        Command::Info { src, no_probe } => {
            let view = query::info(ctx, registry, &src, !no_probe)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print!("{view}");
            }
        }

        Command::List => {
            let views = query::list(registry, downloads_dir);
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                eprintln!("No aliases registered in {}", registry.location().display());
            } else {
                for view in &views {
                    println!("{view}");
                }
            }
        }

        Command::Remove { alias, purge } => {
            let record = resolver::remove(downloads_dir, registry, &alias, purge)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&RecordView::new(&record, downloads_dir))?);
            } else {
                println!("removed {} ({})", record.alias, record.source_ref);
            }
        }
    }

    Ok(())
}

fn derive_request<'a>(kind: DerivationKind, range: &'a RangeArgs, fmt: &'a str) -> DeriveRequest<'a> {
    let mut request = DeriveRequest::new(kind, &range.src, &range.start);
    request.end = range.end.as_deref();
    request.format = Some(fmt);
    request.output_dir = range.out.as_deref();
    request.source_format = range.source_format.as_deref();
    request
}

fn print_artifact(artifact: maker_core::Artifact, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
    } else {
        println!("{}", artifact.path.display());
    }
    Ok(())
}
