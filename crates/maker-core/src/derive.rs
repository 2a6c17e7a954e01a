//! Clip and audio derivation from a resolved resource.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ports::TransformRequest;
use crate::registry::AliasRegistry;
use crate::resolver;
use crate::timerange::{self, TimeRange};
use crate::Context;

/// Append-only log of derived artifacts, one per output directory.
pub const ARTIFACT_LOG: &str = "artifacts.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mkv,
    Webm,
    Gif,
    M4a,
    Wav,
    Mp3,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 7] = [
        OutputFormat::Mp4,
        OutputFormat::Mkv,
        OutputFormat::Webm,
        OutputFormat::Gif,
        OutputFormat::M4a,
        OutputFormat::Wav,
        OutputFormat::Mp3,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Webm => "webm",
            OutputFormat::Gif => "gif",
            OutputFormat::M4a => "m4a",
            OutputFormat::Wav => "wav",
            OutputFormat::Mp3 => "mp3",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, OutputFormat::M4a | OutputFormat::Wav | OutputFormat::Mp3)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| Error::Input(format!("unsupported output format: {s}")))
    }
}

/// Which kind of artifact to derive; decides the accepted formats and the
/// default output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationKind {
    Clip,
    Audio,
}

impl DerivationKind {
    pub fn accepts(self, format: OutputFormat) -> bool {
        match self {
            DerivationKind::Clip => !format.is_audio(),
            DerivationKind::Audio => format.is_audio(),
        }
    }

    pub fn default_format(self) -> OutputFormat {
        match self {
            DerivationKind::Clip => OutputFormat::Mp4,
            DerivationKind::Audio => OutputFormat::M4a,
        }
    }

    fn output_dir(self, ctx: &Context<'_>) -> PathBuf {
        match self {
            DerivationKind::Clip => ctx.config.clips_dir.clone(),
            DerivationKind::Audio => ctx.config.audio_dir.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeriveRequest<'a> {
    pub kind: DerivationKind,
    /// Alias, URL or local file
    pub reference: &'a str,
    /// Start and end are cut and named at millisecond precision; finer
    /// digits are rounded away.
    pub start: &'a str,
    /// Absent means "to the end of the input"
    pub end: Option<&'a str>,
    /// Output format name; the kind's default when absent
    pub format: Option<&'a str>,
    pub output_dir: Option<&'a Path>,
    pub allow_no_audio: bool,
    /// Format selector used if the reference has to be downloaded first
    pub source_format: Option<&'a str>,
}

impl<'a> DeriveRequest<'a> {
    pub fn new(kind: DerivationKind, reference: &'a str, start: &'a str) -> Self {
        Self {
            kind,
            reference,
            start,
            end: None,
            format: None,
            output_dir: None,
            allow_no_audio: false,
            source_format: None,
        }
    }
}

/// A derived file. Never registered as an alias.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub start: f64,
    pub end: Option<f64>,
    pub format: OutputFormat,
    pub derived_from: PathBuf,
    pub alias: Option<String>,
    pub source_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Produce a clip or audio artifact.
///
/// The time range and the format are checked before the reference is
/// resolved, so bad input never triggers a download. Identical requests
/// write to the same path.
pub fn derive(ctx: &Context<'_>, registry: &mut AliasRegistry, request: &DeriveRequest<'_>) -> Result<Artifact> {
    let range = timerange::resolve(request.start, request.end)?;
    let format = match request.format {
        Some(name) => name.parse()?,
        None => request.kind.default_format(),
    };
    if !request.kind.accepts(format) {
        return Err(Error::Input(format!(
            "{} output does not support format {}",
            kind_name(request.kind),
            format
        )));
    }

    let resource = resolver::resolve(ctx, registry, request.reference, request.source_format)?;
    ctx.cancel.check()?;

    let output_dir = request
        .output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| request.kind.output_dir(ctx));
    fs::create_dir_all(&output_dir)?;
    let output = output_dir.join(output_name(&resource.stem(), &range, format));

    info!(
        reference = %request.reference,
        input = %resource.path.display(),
        output = %output.display(),
        %format,
        "deriving"
    );
    let transform = TransformRequest {
        input: &resource.path,
        start: range.start,
        span: range.span,
        format,
        output: &output,
        allow_no_audio: request.allow_no_audio,
    };
    let path = ctx
        .processor
        .transform(&transform, &ctx.cancel)
        .map_err(|e| Error::processing(request.reference, e))?;

    let artifact = Artifact {
        path,
        start: range.start,
        end: range.end(),
        format,
        derived_from: resource.path.clone(),
        alias: resource.alias.clone(),
        source_hash: hash_file(&resource.path)?,
        created_at: Utc::now(),
    };

    if let Err(e) = append_log(&output_dir.join(ARTIFACT_LOG), &artifact) {
        warn!(dir = %output_dir.display(), error = %e, "could not append to artifact log");
    }
    info!(path = %artifact.path.display(), "artifact written");
    Ok(artifact)
}

fn kind_name(kind: DerivationKind) -> &'static str {
    match kind {
        DerivationKind::Clip => "clip",
        DerivationKind::Audio => "audio",
    }
}

/// `<stem>_<HH-MM-SS.mmm>_to_<HH-MM-SS.mmm|end>.<ext>`
fn output_name(stem: &str, range: &TimeRange, format: OutputFormat) -> String {
    let stamp = |secs: f64| timerange::format_time(secs).replace(':', "-");
    let end = range.end().map(stamp).unwrap_or_else(|| "end".to_string());
    format!("{}_{}_to_{}.{}", stem, stamp(range.start), end, format.extension())
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn append_log(path: &Path, artifact: &Artifact) -> io::Result<()> {
    let mut line = serde_json::to_vec(artifact).map_err(io::Error::from)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}
