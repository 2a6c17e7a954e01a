//! Read-only views over the registry: `info` and `list`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ports::MediaProbe;
use crate::record::{MediaRecord, Metadata};
use crate::registry::AliasRegistry;
use crate::resolver::is_url;
use crate::timerange::format_clock;
use crate::Context;

/// Fields `info` tries to fill from a live probe when the record lacks them.
const PROBED_FIELDS: &[&str] = &["title", "duration"];

/// One registry record prepared for printing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    pub alias: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub source_ref: String,
    pub local_path: Option<PathBuf>,
    /// Whether the downloaded file is still on disk
    pub present: bool,
    pub format: String,
    pub is_playlist_member: bool,
    pub playlist_index: Option<u32>,
    pub downloaded_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl RecordView {
    pub fn new(record: &MediaRecord, downloads_dir: &Path) -> Self {
        let local_path = record.resolved_path(downloads_dir);
        Self {
            alias: record.alias.clone(),
            title: record.title().map(str::to_string),
            duration: record.duration(),
            source_ref: record.source_ref.clone(),
            present: local_path.as_deref().is_some_and(Path::exists),
            local_path,
            format: record.format.clone(),
            is_playlist_member: record.is_playlist_member,
            playlist_index: record.playlist_index,
            downloaded_at: record.downloaded_at,
            metadata: record.metadata.clone(),
        }
    }
}

impl fmt::Display for RecordView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.alias,
            self.title.as_deref().unwrap_or("unknown title"),
            self.duration.map(format_clock).unwrap_or_else(|| "unknown".to_string())
        )?;
        if !self.present {
            write!(f, " [missing file]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InfoView {
    /// A registered alias, optionally enriched by probes.
    Record {
        record: RecordView,
        probe: Option<MediaProbe>,
        /// Fields neither the record nor a probe could supply
        unknown: Vec<String>,
    },
    /// An unregistered URL, described by the downloader alone.
    Remote { url: String, metadata: Metadata },
    LocalFile { path: PathBuf, probe: Option<MediaProbe> },
}

impl fmt::Display for InfoView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoView::Record { record, probe, unknown } => {
                writeln!(f, "{record}")?;
                writeln!(f, "  source:     {}", record.source_ref)?;
                if let Some(path) = &record.local_path {
                    writeln!(f, "  file:       {}", path.display())?;
                }
                writeln!(f, "  format:     {}", record.format)?;
                if let Some(index) = record.playlist_index {
                    writeln!(f, "  playlist #: {index}")?;
                }
                writeln!(f, "  downloaded: {}", record.downloaded_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
                if let Some(probe) = probe {
                    write_probe(f, probe)?;
                }
                if !unknown.is_empty() {
                    writeln!(f, "  unknown:    {}", unknown.join(", "))?;
                }
                Ok(())
            }
            InfoView::Remote { url, metadata } => {
                writeln!(f, "{url} (not downloaded)")?;
                for (key, value) in metadata {
                    match value {
                        Value::String(s) => writeln!(f, "  {key}: {s}")?,
                        other => writeln!(f, "  {key}: {other}")?,
                    }
                }
                Ok(())
            }
            InfoView::LocalFile { path, probe } => {
                writeln!(f, "{} (local file)", path.display())?;
                match probe {
                    Some(probe) => write_probe(f, probe),
                    None => writeln!(f, "  media details unknown"),
                }
            }
        }
    }
}

fn write_probe(f: &mut fmt::Formatter<'_>, probe: &MediaProbe) -> fmt::Result {
    if let Some(d) = probe.duration {
        writeln!(f, "  duration:   {}", format_clock(d))?;
    }
    if let (Some(w), Some(h)) = (probe.width, probe.height) {
        writeln!(f, "  resolution: {w}x{h}")?;
    }
    if let Some(fps) = probe.fps {
        writeln!(f, "  fps:        {fps:.2}")?;
    }
    writeln!(f, "  audio:      {}", if probe.has_audio { "yes" } else { "no" })
}

/// Describe a reference.
///
/// For an alias, probe failures only leave fields unknown. For an
/// unregistered URL the downloader probe is all there is, so its failure is
/// a `Download` error.
pub fn info(ctx: &Context<'_>, registry: &AliasRegistry, reference: &str, probe: bool) -> Result<InfoView> {
    let downloads_dir = &ctx.config.downloads_dir;

    let record = registry
        .get(reference)
        .or_else(|| is_url(reference).then(|| registry.find_by_source(reference)).flatten());
    if let Some(record) = record {
        return Ok(record_info(ctx, record, downloads_dir, probe));
    }

    if is_url(reference) {
        let metadata = if probe {
            ctx.downloader
                .probe(reference, &ctx.cancel)
                .map_err(|e| Error::download(reference, e))?
        } else {
            Metadata::new()
        };
        return Ok(InfoView::Remote {
            url: reference.to_string(),
            metadata,
        });
    }

    let path = Path::new(reference);
    if path.is_file() {
        let media = if probe { probe_local(ctx, path) } else { None };
        return Ok(InfoView::LocalFile {
            path: path.to_path_buf(),
            probe: media,
        });
    }

    Err(Error::NotFound(format!(
        "'{reference}' is not a known alias, a URL, or an existing file"
    )))
}

fn record_info(ctx: &Context<'_>, record: &MediaRecord, downloads_dir: &Path, probe: bool) -> InfoView {
    let mut view = RecordView::new(record, downloads_dir);
    let mut media = None;

    if probe {
        if view.present {
            if let Some(path) = view.local_path.as_deref() {
                media = probe_local(ctx, path);
            }
        }
        if view.duration.is_none() {
            view.duration = media.as_ref().and_then(|m| m.duration);
        }

        let lacking = view.title.is_none() || view.duration.is_none();
        if lacking && is_url(&record.source_ref) {
            match ctx.downloader.probe(&record.source_ref, &ctx.cancel) {
                Ok(remote) => {
                    if view.title.is_none() {
                        view.title = remote.get("title").and_then(Value::as_str).map(str::to_string);
                    }
                    if view.duration.is_none() {
                        view.duration = remote.get("duration").and_then(Value::as_f64);
                    }
                }
                Err(e) => warn!(alias = %record.alias, error = %e, "re-probe failed"),
            }
        }
    }

    let unknown = PROBED_FIELDS
        .iter()
        .filter(|field| match **field {
            "title" => view.title.is_none(),
            "duration" => view.duration.is_none(),
            _ => false,
        })
        .map(|field| field.to_string())
        .collect();

    InfoView::Record {
        record: view,
        probe: media,
        unknown,
    }
}

fn probe_local(ctx: &Context<'_>, path: &Path) -> Option<MediaProbe> {
    match ctx.processor.probe(path, &ctx.cancel) {
        Ok(media) => Some(media),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "local probe failed");
            None
        }
    }
}

/// Every record, oldest download first.
pub fn list(registry: &AliasRegistry, downloads_dir: &Path) -> Vec<RecordView> {
    registry
        .list()
        .into_iter()
        .map(|record| RecordView::new(record, downloads_dir))
        .collect()
}
