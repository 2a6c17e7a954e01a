//! Tool configuration.
//!
//! Priority, highest first: command-line flags, environment, TOML file,
//! built-in defaults. Flags and environment are applied by the caller through
//! [`ConfigOverrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Config file looked up in the working directory when none is named.
pub const DEFAULT_CONFIG_FILENAME: &str = "maker.toml";

/// Format selector used when a download names none.
pub const DEFAULT_FORMAT: &str = "bestvideo+bestaudio/best";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MakerConfig {
    /// Downloads land in `<downloads_dir>/<alias>/`; the registry file lives here too
    pub downloads_dir: PathBuf,
    pub clips_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub default_format: String,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// Parallel playlist downloads
    pub workers: usize,
    /// Kill external tools running longer than this
    pub tool_timeout_secs: Option<u64>,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            clips_dir: PathBuf::from("clips"),
            audio_dir: PathBuf::from("audio"),
            default_format: DEFAULT_FORMAT.to_string(),
            ytdlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            workers: 4,
            tool_timeout_secs: None,
        }
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub ytdlp_bin: Option<String>,
    pub ffmpeg_bin: Option<String>,
    pub ffprobe_bin: Option<String>,
    pub workers: Option<usize>,
}

impl MakerConfig {
    /// Load configuration.
    ///
    /// With `explicit` set, that file must exist and parse. Otherwise
    /// `maker.toml` in the working directory is used when present.
    pub fn load(explicit: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Input(format!("cannot read config {}: {}", path.display(), e)))?;
        let config: MakerConfig = toml::from_str(&content)
            .map_err(|e| Error::Input(format!("cannot parse config {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(dir) = overrides.downloads_dir {
            self.downloads_dir = dir;
        }
        if let Some(bin) = overrides.ytdlp_bin {
            self.ytdlp_bin = bin;
        }
        if let Some(bin) = overrides.ffmpeg_bin {
            self.ffmpeg_bin = bin;
        }
        if let Some(bin) = overrides.ffprobe_bin {
            self.ffprobe_bin = bin;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Input("workers must be at least 1".to_string()));
        }
        if self.default_format.trim().is_empty() {
            return Err(Error::Input("default_format must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}
