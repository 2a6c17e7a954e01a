//! Capability boundaries to external tools.
//!
//! The core only talks to [`Downloader`] and [`Processor`]; the subprocess
//! adapters in this module are one implementation, tests use fakes.

pub mod ffmpeg;
pub mod process;
pub mod ytdlp;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::derive::OutputFormat;
use crate::record::Metadata;
use crate::timerange::Span;

pub use ffmpeg::FfmpegProcessor;
pub use ytdlp::YtDlpDownloader;

/// Failure reported by a port implementation.
#[derive(Error, Debug)]
pub enum PortError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {}", .status.map_or("signal".to_string(), |s| s.to_string()))]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from {program}: {reason}")]
    Output { program: String, reason: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// One fetch request handed to the downloader.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub format: String,
    /// Directory the artifact must be written into
    pub dest_dir: PathBuf,
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub local_path: PathBuf,
    pub metadata: Metadata,
}

/// One entry of an expanded playlist, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    /// 1-based position in the playlist
    pub index: u32,
    pub url: String,
    pub title: Option<String>,
}

/// A playlist listing without any media fetched.
#[derive(Debug, Clone)]
pub struct PlaylistListing {
    pub title: Option<String>,
    pub id: Option<String>,
    pub entries: Vec<PlaylistEntry>,
}

pub trait Downloader: Send + Sync {
    /// Fetch a single item into `request.dest_dir`.
    fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<Fetched, PortError>;

    /// List the items of a playlist reference. A plain video reference yields
    /// a listing with one entry.
    fn expand(&self, url: &str, cancel: &CancellationToken) -> Result<PlaylistListing, PortError>;

    /// Metadata for a source without downloading it.
    fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<Metadata, PortError>;
}

/// What to produce from an input file.
#[derive(Debug, Clone)]
pub struct TransformRequest<'a> {
    pub input: &'a Path,
    pub start: f64,
    pub span: Span,
    pub format: OutputFormat,
    pub output: &'a Path,
    /// Accept video-only output when the input has no audio stream
    pub allow_no_audio: bool,
}

/// Stream-level facts about a local media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaProbe {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub has_audio: bool,
    pub container: Option<String>,
}

pub trait Processor: Send + Sync {
    /// Write the derived artifact to `request.output` and return its path; the
    /// stderr of a failing tool is returned in [`PortError::Failed`].
    fn transform(&self, request: &TransformRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf, PortError>;

    fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaProbe, PortError>;
}
