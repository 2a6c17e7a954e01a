//! Deterministic port fakes and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::cancel::CancellationToken;
use crate::config::MakerConfig;
use crate::ports::{
    Downloader, FetchRequest, Fetched, MediaProbe, PlaylistEntry, PlaylistListing, PortError, Processor,
    TransformRequest,
};
use crate::record::{MediaRecord, Metadata};
use crate::registry::AliasRegistry;
use crate::timerange::Span;
use crate::OutputFormat;

/// Config with every directory inside `root`.
pub fn config(root: &Path) -> MakerConfig {
    MakerConfig {
        downloads_dir: root.join("downloads"),
        clips_dir: root.join("clips"),
        audio_dir: root.join("audio"),
        ..MakerConfig::default()
    }
}

/// Register `alias` with a file at `<downloads>/<alias>/<alias>.mp4`, a
/// capitalized title and a 65 second duration.
pub fn register(registry: &mut AliasRegistry, config: &MakerConfig, alias: &str, source: &str) {
    let mut title = alias.to_string();
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    let mut meta = Metadata::new();
    meta.insert("title".to_string(), json!(title));
    meta.insert("duration".to_string(), json!(65.0));
    register_with(registry, config, alias, source, meta);
}

/// Each call is stamped one minute after the previous one, so listing order
/// follows registration order.
pub fn register_with(registry: &mut AliasRegistry, config: &MakerConfig, alias: &str, source: &str, meta: Metadata) {
    let dir = config.downloads_dir.join(alias);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{alias}.mp4")), alias.as_bytes()).unwrap();

    let mut record = MediaRecord::new(alias, source, PathBuf::from(alias).join(format!("{alias}.mp4")), "best", meta);
    record.downloaded_at = Utc.timestamp_opt(1_700_000_000 + registry.len() as i64 * 60, 0).unwrap();
    registry.put(record, true).unwrap();
}

fn video_metadata(url: &str, title: &str) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("id".to_string(), json!(url.rsplit('/').next().unwrap_or(url)));
    meta.insert("title".to_string(), json!(title));
    meta.insert("duration".to_string(), json!(65.0));
    meta.insert("webpage_url".to_string(), json!(url));
    meta
}

/// Downloader answering from canned videos, playlists and failures.
#[derive(Default)]
pub struct FakeDownloader {
    videos: HashMap<String, String>,
    failures: HashMap<String, String>,
    playlists: HashMap<String, (String, Vec<String>)>,
    bare_fetch: bool,
    interrupt: Option<CancellationToken>,
    calls: Mutex<Vec<String>>,
    fetches: Mutex<Vec<FetchRequest>>,
}

impl FakeDownloader {
    pub fn with_video(mut self, url: &str, title: &str) -> Self {
        self.videos.insert(url.to_string(), title.to_string());
        self
    }

    pub fn with_failure(mut self, url: &str, message: &str) -> Self {
        self.failures.insert(url.to_string(), message.to_string());
        self
    }

    pub fn with_playlist(mut self, url: &str, title: &str, items: &[&str]) -> Self {
        let items = items.iter().map(|s| s.to_string()).collect();
        self.playlists.insert(url.to_string(), (title.to_string(), items));
        self
    }

    /// Fetches return a file but no metadata.
    pub fn with_bare_fetch(mut self) -> Self {
        self.bare_fetch = true;
        self
    }

    /// Every fetch trips `token` before answering, as a Ctrl-C arriving
    /// mid-download would.
    pub fn interrupted_by(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Every fetch request, in call order.
    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.fetches.lock().unwrap().clone()
    }

    /// Every call as `"<operation> <url>"`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("fetch ")).count()
    }

    fn record(&self, operation: &str, url: &str) {
        self.calls.lock().unwrap().push(format!("{operation} {url}"));
    }

    fn lookup(&self, url: &str) -> Result<&str, PortError> {
        if let Some(message) = self.failures.get(url) {
            return Err(PortError::Other(message.clone()));
        }
        self.videos
            .get(url)
            .map(String::as_str)
            .ok_or_else(|| PortError::Other(format!("unsupported URL: {url}")))
    }
}

impl Downloader for FakeDownloader {
    fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<Fetched, PortError> {
        self.record("fetch", &request.url);
        self.fetches.lock().unwrap().push(request.clone());
        if let Some(token) = &self.interrupt {
            token.cancel();
        }
        if cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        let title = self.lookup(&request.url)?;
        fs::create_dir_all(&request.dest_dir).map_err(|e| PortError::Other(e.to_string()))?;
        let local_path = request.dest_dir.join(format!("{title}.mp4"));
        fs::write(&local_path, request.url.as_bytes()).map_err(|e| PortError::Other(e.to_string()))?;
        let metadata = if self.bare_fetch {
            Metadata::new()
        } else {
            video_metadata(&request.url, title)
        };
        Ok(Fetched { local_path, metadata })
    }

    fn expand(&self, url: &str, cancel: &CancellationToken) -> Result<PlaylistListing, PortError> {
        self.record("expand", url);
        if cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        if let Some((title, items)) = self.playlists.get(url) {
            return Ok(PlaylistListing {
                title: Some(title.clone()),
                id: None,
                entries: items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| PlaylistEntry {
                        index: i as u32 + 1,
                        url: item.clone(),
                        title: self.videos.get(item).cloned(),
                    })
                    .collect(),
            });
        }
        let title = self.lookup(url)?;
        Ok(PlaylistListing {
            title: Some(title.to_string()),
            id: None,
            entries: vec![PlaylistEntry {
                index: 1,
                url: url.to_string(),
                title: Some(title.to_string()),
            }],
        })
    }

    fn probe(&self, url: &str, _cancel: &CancellationToken) -> Result<Metadata, PortError> {
        self.record("probe", url);
        let title = self.lookup(url)?;
        Ok(video_metadata(url, title))
    }
}

/// What the fake processor was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedTransform {
    pub input: PathBuf,
    pub start: f64,
    pub span: Span,
    pub format: OutputFormat,
    pub output: PathBuf,
}

/// Processor that writes a small file instead of transcoding.
pub struct FakeProcessor {
    has_audio: bool,
    probe_works: bool,
    fail_stderr: Option<String>,
    calls: Mutex<Vec<RecordedTransform>>,
}

impl Default for FakeProcessor {
    fn default() -> Self {
        Self {
            has_audio: true,
            probe_works: true,
            fail_stderr: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeProcessor {
    pub fn without_audio(mut self) -> Self {
        self.has_audio = false;
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.probe_works = false;
        self
    }

    /// Every transform fails with a non-zero exit and this stderr.
    pub fn failing_with(mut self, stderr: &str) -> Self {
        self.fail_stderr = Some(stderr.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedTransform> {
        self.calls.lock().unwrap().clone()
    }
}

impl Processor for FakeProcessor {
    fn transform(&self, request: &TransformRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf, PortError> {
        self.calls.lock().unwrap().push(RecordedTransform {
            input: request.input.to_path_buf(),
            start: request.start,
            span: request.span,
            format: request.format,
            output: request.output.to_path_buf(),
        });
        if cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        if let Some(stderr) = &self.fail_stderr {
            return Err(PortError::Failed {
                program: "ffmpeg".to_string(),
                status: Some(1),
                stderr: stderr.clone(),
            });
        }
        if !self.has_audio && (request.format.is_audio() || !request.allow_no_audio) {
            return Err(PortError::Other(format!("{} has no audio stream", request.input.display())));
        }
        fs::write(request.output, b"derived").map_err(|e| PortError::Other(e.to_string()))?;
        Ok(request.output.to_path_buf())
    }

    fn probe(&self, _path: &Path, _cancel: &CancellationToken) -> Result<MediaProbe, PortError> {
        if !self.probe_works {
            return Err(PortError::Other("probe unavailable".to_string()));
        }
        Ok(MediaProbe {
            duration: Some(60.0),
            width: Some(1280),
            height: Some(720),
            fps: Some(30.0),
            has_audio: self.has_audio,
            container: Some("mp4".to_string()),
        })
    }
}
