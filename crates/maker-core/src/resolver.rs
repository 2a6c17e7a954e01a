//! Turning a user reference (alias, URL or local file) into a local resource,
//! downloading through the [`Downloader`](crate::ports::Downloader) when needed.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alias;
use crate::error::{Error, Result};
use crate::ports::{FetchRequest, Fetched, PortError};
use crate::record::{MediaRecord, Metadata};
use crate::registry::AliasRegistry;
use crate::Context;

/// A concrete input file plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalResource {
    pub path: PathBuf,
    /// Set when the resource is a registry entry
    pub alias: Option<String>,
    pub source_ref: String,
    /// Whether resolving it required a download in this command
    pub downloaded: bool,
}

impl LocalResource {
    /// Name used for derived artifacts: the alias, else the file stem.
    pub fn stem(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output")
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest<'a> {
    pub reference: &'a str,
    pub alias: Option<&'a str>,
    pub format: Option<&'a str>,
    pub playlist: bool,
    /// Replace a record bound to a different source under the requested alias
    pub overwrite: bool,
}

/// One playlist item that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub index: Option<u32>,
    pub url: String,
    pub error: String,
}

/// Aliases registered by a download, plus the items that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub aliases: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

pub fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Resolve `reference` to a local file.
///
/// Order: known alias (no network), URL already recorded under some alias,
/// fresh URL (downloaded, registered, flushed), existing local file.
pub fn resolve(ctx: &Context<'_>, registry: &mut AliasRegistry, reference: &str, format: Option<&str>) -> Result<LocalResource> {
    let downloads_dir = &ctx.config.downloads_dir;

    if let Some(record) = registry.get(reference) {
        return record_resource(record, downloads_dir);
    }

    if is_url(reference) {
        if let Some(record) = registry.find_by_source(reference) {
            if let Ok(resource) = record_resource(record, downloads_dir) {
                debug!(alias = %record.alias, url = %reference, "url already downloaded");
                return Ok(resource);
            }
        }

        let request = DownloadRequest {
            reference,
            format,
            ..Default::default()
        };
        let alias = download_single(ctx, registry, &request)?;
        registry.flush()?;
        let record = registry
            .get(&alias)
            .ok_or_else(|| Error::NotFound(format!("alias '{alias}' vanished after download")))?;
        let mut resource = record_resource(record, downloads_dir)?;
        resource.downloaded = true;
        return Ok(resource);
    }

    let path = Path::new(reference);
    if path.is_file() {
        return Ok(LocalResource {
            path: path.to_path_buf(),
            alias: None,
            source_ref: reference.to_string(),
            downloaded: false,
        });
    }

    Err(Error::NotFound(format!(
        "'{reference}' is not a known alias, a URL, or an existing file"
    )))
}

/// Download a reference and register the result. Flushes the registry once
/// at the end when anything was registered.
pub fn download(ctx: &Context<'_>, registry: &mut AliasRegistry, request: &DownloadRequest<'_>) -> Result<DownloadOutcome> {
    if let Some(alias) = request.alias {
        alias::validate(alias)?;
    }

    let outcome = if request.playlist {
        download_playlist(ctx, registry, request)?
    } else {
        let alias = download_single(ctx, registry, request)?;
        DownloadOutcome {
            aliases: vec![alias],
            failures: Vec::new(),
        }
    };

    registry.flush()?;
    Ok(outcome)
}

/// Drop an alias from the registry and flush. With `purge`, the alias's
/// download directory goes too.
pub fn remove(downloads_dir: &Path, registry: &mut AliasRegistry, alias: &str, purge: bool) -> Result<MediaRecord> {
    if purge {
        alias::validate(alias)?;
    }
    let record = registry.remove(alias)?;
    registry.flush()?;

    if purge {
        let dir = downloads_dir.join(&record.alias);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
            info!(alias = %alias, dir = %dir.display(), "purged download directory");
        } else {
            debug!(alias = %alias, dir = %dir.display(), "nothing to purge");
        }
    }
    Ok(record)
}

fn record_resource(record: &MediaRecord, downloads_dir: &Path) -> Result<LocalResource> {
    let path = record
        .resolved_path(downloads_dir)
        .filter(|p| p.exists())
        .ok_or_else(|| {
            Error::NotFound(format!(
                "alias '{}' is registered but its file {} is missing",
                record.alias,
                record
                    .local_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ))
        })?;

    Ok(LocalResource {
        path,
        alias: Some(record.alias.clone()),
        source_ref: record.source_ref.clone(),
        downloaded: false,
    })
}

fn download_single(ctx: &Context<'_>, registry: &mut AliasRegistry, request: &DownloadRequest<'_>) -> Result<String> {
    let reference = request.reference;
    let format = request.format.unwrap_or(&ctx.config.default_format);

    let (target, reserved, probed) = match request.alias {
        Some(alias) => {
            registry.check_put(alias, reference, request.overwrite)?;
            (alias.to_string(), false, Metadata::new())
        }
        None => {
            let probed = ctx
                .downloader
                .probe(reference, &ctx.cancel)
                .map_err(|e| Error::download(reference, e))?;
            match registry.find_by_source(reference) {
                Some(existing) => (existing.alias.clone(), false, probed),
                None => {
                    let base = alias::derive_base(
                        probed.get("title").and_then(|v| v.as_str()),
                        probed.get("id").and_then(|v| v.as_str()),
                    );
                    (registry.allocate_alias(&base), true, probed)
                }
            }
        }
    };

    let fetch = FetchRequest {
        url: reference.to_string(),
        format: format.to_string(),
        dest_dir: ctx.config.downloads_dir.join(&target),
    };
    let fetched = match ctx.downloader.fetch(&fetch, &ctx.cancel) {
        Ok(fetched) => fetched,
        Err(e) => {
            if reserved {
                registry.release(&target);
            }
            return Err(Error::download(reference, e));
        }
    };

    let record = build_record(&target, reference, format, fetched, probed, &ctx.config.downloads_dir);
    registry.put(record, request.overwrite)?;
    info!(alias = %target, url = %reference, "download registered");
    Ok(target)
}

/// Planned work for one playlist item: where it goes and under which alias.
struct PlannedItem {
    index: u32,
    url: String,
    alias: String,
    /// Freshly allocated, to be released if the item fails
    reserved: bool,
    /// Title from the playlist listing
    title: Option<String>,
}

impl PlannedItem {
    /// Used when the fetch reports no metadata of its own.
    fn fallback_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        if let Some(title) = &self.title {
            meta.insert("title".to_string(), title.clone().into());
        }
        meta
    }
}

fn download_playlist(ctx: &Context<'_>, registry: &mut AliasRegistry, request: &DownloadRequest<'_>) -> Result<DownloadOutcome> {
    let reference = request.reference;
    let format = request.format.unwrap_or(&ctx.config.default_format);

    let listing = ctx
        .downloader
        .expand(reference, &ctx.cancel)
        .map_err(|e| Error::download(reference, e))?;
    if listing.entries.is_empty() {
        return Err(Error::download(reference, PortError::Other("playlist has no entries".to_string())));
    }

    let base = match request.alias {
        Some(alias) => alias.to_string(),
        None => alias::derive_base(listing.title.as_deref(), listing.id.as_deref()),
    };

    // Aliases are assigned up front, in playlist order, by this thread only.
    // An item already downloaded from the same URL keeps its alias.
    let mut entries = listing.entries;
    entries.sort_by_key(|e| e.index);
    let plan: Vec<PlannedItem> = entries
        .into_iter()
        .map(|entry| match registry.find_by_source(&entry.url) {
            Some(existing) => PlannedItem {
                index: entry.index,
                url: entry.url,
                alias: existing.alias.clone(),
                reserved: false,
                title: entry.title,
            },
            None => PlannedItem {
                index: entry.index,
                alias: registry.allocate_alias(&base),
                url: entry.url,
                reserved: true,
                title: entry.title,
            },
        })
        .collect();

    info!(url = %reference, items = plan.len(), workers = ctx.config.workers, "downloading playlist");
    let results = fetch_all(ctx, &plan, format)?;

    if ctx.cancel.is_cancelled() || results.iter().any(|r| matches!(r, Err(PortError::Cancelled))) {
        for item in plan.iter().filter(|i| i.reserved) {
            registry.release(&item.alias);
        }
        return Err(Error::Cancelled);
    }

    let mut outcome = DownloadOutcome::default();
    for (item, result) in plan.iter().zip(results) {
        match result {
            Ok(fetched) => {
                let record = build_record(&item.alias, &item.url, format, fetched, item.fallback_metadata(), &ctx.config.downloads_dir)
                    .with_playlist_index(item.index);
                registry.put(record, false)?;
                outcome.aliases.push(item.alias.clone());
            }
            Err(e) => {
                warn!(index = item.index, url = %item.url, error = %e, "playlist item failed");
                if item.reserved {
                    registry.release(&item.alias);
                }
                outcome.failures.push(ItemFailure {
                    index: Some(item.index),
                    url: item.url.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if outcome.aliases.is_empty() {
        let first = outcome
            .failures
            .first()
            .map(|f| f.error.clone())
            .unwrap_or_default();
        return Err(Error::download(
            reference,
            PortError::Other(format!("all {} playlist items failed; first: {}", outcome.failures.len(), first)),
        ));
    }

    info!(
        registered = outcome.aliases.len(),
        failed = outcome.failures.len(),
        "playlist download finished"
    );
    Ok(outcome)
}

/// Fetch every planned item on a bounded pool. Results come back in plan order.
fn fetch_all(ctx: &Context<'_>, plan: &[PlannedItem], format: &str) -> Result<Vec<std::result::Result<Fetched, PortError>>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.config.workers.max(1))
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    let total = plan.len() as u64;
    let counter = AtomicU64::new(0);
    let tp = ctx.progress();

    Ok(pool.install(|| {
        plan.par_iter()
            .map(|item| {
                if ctx.cancel.is_cancelled() {
                    return Err(PortError::Cancelled);
                }
                let request = FetchRequest {
                    url: item.url.clone(),
                    format: format.to_string(),
                    dest_dir: ctx.config.downloads_dir.join(&item.alias),
                };
                let result = ctx.downloader.fetch(&request, &ctx.cancel);
                let current = counter.fetch_add(1, Ordering::Relaxed);
                tp.report("download", current, total, &item.alias);
                result
            })
            .collect()
    }))
}

fn build_record(alias: &str, source_ref: &str, format: &str, fetched: Fetched, fallback: Metadata, downloads_dir: &Path) -> MediaRecord {
    let metadata = if fetched.metadata.is_empty() {
        fallback
    } else {
        fetched.metadata
    };
    let local_path = storable_path(&fetched.local_path, downloads_dir);
    MediaRecord::new(alias, source_ref, local_path, format, metadata)
}

/// Paths inside the downloads directory are stored relative to it.
fn storable_path(local: &Path, downloads_dir: &Path) -> PathBuf {
    match pathdiff::diff_paths(local, downloads_dir) {
        Some(rel) if !rel.components().any(|c| c == Component::ParentDir) => rel,
        _ => local.to_path_buf(),
    }
}
