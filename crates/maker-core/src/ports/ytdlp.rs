//! Downloader backed by the `yt-dlp` executable.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::process;
use super::{Downloader, FetchRequest, Fetched, PlaylistEntry, PlaylistListing, PortError};
use crate::cancel::CancellationToken;
use crate::record::Metadata;

/// Info-dict fields kept as record metadata.
const METADATA_KEYS: &[&str] = &[
    "id",
    "title",
    "duration",
    "uploader",
    "upload_date",
    "view_count",
    "webpage_url",
    "thumbnail",
    "extractor",
    "description",
];
const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    bin: String,
    timeout: Option<Duration>,
}

impl YtDlpDownloader {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn run_json(&self, args: &[&str], url: &str, cancel: &CancellationToken) -> Result<Value, PortError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).arg("--").arg(url);
        let output = process::run(cmd, cancel, self.timeout)?;
        serde_json::from_slice(&output.stdout).map_err(|e| self.bad_output(e.to_string()))
    }

    fn bad_output(&self, reason: String) -> PortError {
        PortError::Output {
            program: self.bin.clone(),
            reason,
        }
    }
}

impl Downloader for YtDlpDownloader {
    fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<Fetched, PortError> {
        fs::create_dir_all(&request.dest_dir).map_err(|e| PortError::Other(format!(
            "cannot create {}: {}",
            request.dest_dir.display(),
            e
        )))?;

        let template = request.dest_dir.join("%(title)s.%(ext)s");
        let mut cmd = Command::new(&self.bin);
        cmd.args(["--no-playlist", "--no-progress", "--windows-filenames", "-f"])
            .arg(&request.format)
            .arg("-o")
            .arg(&template)
            .args(["--print", "after_move:%()j"])
            .arg("--")
            .arg(&request.url);

        info!(url = %request.url, dest = %request.dest_dir.display(), "downloading");
        let started = SystemTime::now();
        let output = process::run(cmd, cancel, self.timeout)?;

        let (filepath, metadata) = parse_fetch_output(&output.stdout).map_err(|r| self.bad_output(r))?;
        let local_path = match filepath.filter(|p| p.exists()) {
            Some(path) => path,
            None => {
                debug!(dest = %request.dest_dir.display(), "no usable filepath printed, scanning destination");
                newest_media_file(&request.dest_dir, started)
                    .ok_or_else(|| self.bad_output(format!("no media file in {}", request.dest_dir.display())))?
            }
        };

        Ok(Fetched { local_path, metadata })
    }

    fn expand(&self, url: &str, cancel: &CancellationToken) -> Result<PlaylistListing, PortError> {
        let value = self.run_json(&["--flat-playlist", "-J"], url, cancel)?;
        Ok(parse_listing(&value, url))
    }

    fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<Metadata, PortError> {
        let value = self.run_json(&["--no-playlist", "-J"], url, cancel)?;
        Ok(pick_metadata(&value))
    }
}

fn pick_metadata(info: &Value) -> Metadata {
    let mut meta = Metadata::new();
    for key in METADATA_KEYS {
        match info.get(*key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if *key == "description" => {
                meta.insert(key.to_string(), Value::String(s.chars().take(MAX_DESCRIPTION_CHARS).collect()));
            }
            Some(v) => {
                meta.insert(key.to_string(), v.clone());
            }
        }
    }
    meta
}

/// The last JSON line printed after the move step is the final info dict.
fn parse_fetch_output(stdout: &[u8]) -> Result<(Option<PathBuf>, Metadata), String> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| "no info JSON printed".to_string())?;
    let info: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;

    let filepath = info
        .get("filepath")
        .or_else(|| info.get("_filename"))
        .and_then(Value::as_str)
        .map(PathBuf::from);
    Ok((filepath, pick_metadata(&info)))
}

fn parse_listing(value: &Value, url: &str) -> PlaylistListing {
    let title = value.get("title").and_then(Value::as_str).map(str::to_string);
    let id = value.get("id").and_then(Value::as_str).map(str::to_string);

    let entries = match value.get("entries").and_then(Value::as_array) {
        Some(entries) if value.get("_type").and_then(Value::as_str) == Some("playlist") => entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let entry_url = entry
                    .get("url")
                    .or_else(|| entry.get("webpage_url"))
                    .and_then(Value::as_str);
                match entry_url {
                    Some(u) => Some(PlaylistEntry {
                        index: i as u32 + 1,
                        url: u.to_string(),
                        title: entry.get("title").and_then(Value::as_str).map(str::to_string),
                    }),
                    None => {
                        warn!(index = i + 1, "playlist entry without url, skipping");
                        None
                    }
                }
            })
            .collect(),
        _ => vec![PlaylistEntry {
            index: 1,
            url: url.to_string(),
            title: title.clone(),
        }],
    };

    PlaylistListing { title, id, entries }
}

/// Newest audio/video file in `dir` modified at or after `since`.
fn newest_media_file(dir: &Path, since: SystemTime) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_file())
        .filter(|e| {
            mime_guess::from_path(e.path()).first().is_some_and(|mime| {
                mime.type_() == mime_guess::mime::VIDEO || mime.type_() == mime_guess::mime::AUDIO
            })
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            (modified >= since).then(|| (modified, e.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}
