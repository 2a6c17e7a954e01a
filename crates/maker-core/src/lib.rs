pub mod alias;
pub mod cancel;
pub mod config;
pub mod derive;
pub mod error;
pub mod ports;
pub mod query;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod timerange;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use cancel::CancellationToken;
pub use config::{ConfigOverrides, MakerConfig};
pub use derive::{Artifact, DerivationKind, DeriveRequest, OutputFormat};
pub use error::{Error, ErrorCategory, Result};
pub use ports::{Downloader, Processor};
pub use query::{InfoView, RecordView};
pub use record::MediaRecord;
pub use registry::AliasRegistry;
pub use resolver::{DownloadOutcome, DownloadRequest, ItemFailure, LocalResource};

/// Type alias for progress callback: `(stage, current, total, message)`
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

/// Throttled progress reporter: emits at most every 200ms, and always on completion.
pub struct ThrottledProgress<'a> {
    inner: Option<&'a ProgressCallback<'a>>,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: Option<&'a ProgressCallback<'a>>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let Some(inner) = self.inner else { return };
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        inner(stage, current, total, message);
    }
}

/// Collaborators shared by every operation of one command.
///
/// The registry is not part of the context; operations take it explicitly.
pub struct Context<'a> {
    pub config: &'a MakerConfig,
    pub downloader: &'a dyn Downloader,
    pub processor: &'a dyn Processor,
    pub cancel: CancellationToken,
    progress: Option<&'a ProgressCallback<'a>>,
}

impl<'a> Context<'a> {
    pub fn new(config: &'a MakerConfig, downloader: &'a dyn Downloader, processor: &'a dyn Processor) -> Self {
        Self {
            config,
            downloader,
            processor,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: &'a ProgressCallback<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn progress(&self) -> ThrottledProgress<'a> {
        ThrottledProgress::new(self.progress)
    }
}
