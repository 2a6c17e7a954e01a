use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque metadata bag supplied by the downloader (title, duration, uploader, ...).
pub type Metadata = Map<String, Value>;

/// One durable registry entry, keyed by its alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub alias: String,
    /// Original URL or source identifier
    pub source_ref: String,
    /// Downloaded artifact; relative paths are relative to the downloads directory.
    /// `None` only while a download is in flight, never persisted.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Format selector used for the download, opaque to the core
    pub format: String,
    #[serde(default)]
    pub is_playlist_member: bool,
    #[serde(default)]
    pub playlist_index: Option<u32>,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MediaRecord {
    /// A record for a completed download.
    pub fn new(alias: &str, source_ref: &str, local_path: PathBuf, format: &str, metadata: Metadata) -> Self {
        Self {
            alias: alias.to_string(),
            source_ref: source_ref.to_string(),
            local_path: Some(local_path),
            format: format.to_string(),
            is_playlist_member: false,
            playlist_index: None,
            downloaded_at: Utc::now(),
            metadata,
        }
    }

    /// Mark the record as item `index` (1-based) of a playlist expansion.
    pub fn with_playlist_index(mut self, index: u32) -> Self {
        self.is_playlist_member = true;
        self.playlist_index = Some(index);
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(Value::as_str)
    }

    /// Duration in seconds, when the downloader reported one.
    pub fn duration(&self) -> Option<f64> {
        self.metadata.get("duration").and_then(Value::as_f64)
    }

    /// Absolute location of the artifact given the downloads directory.
    pub fn resolved_path(&self, downloads_dir: &Path) -> Option<PathBuf> {
        self.local_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                downloads_dir.join(p)
            }
        })
    }
}
