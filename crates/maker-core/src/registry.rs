//! Durable alias -> record mapping.
//!
//! The registry is loaded once per command, mutated in memory, and flushed
//! once at the end of a mutating command. Flushing writes a temp file and
//! renames it into place so readers and crashes only ever see a whole file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alias;
use crate::error::{Error, Result};
use crate::record::MediaRecord;

/// Registry file name inside the downloads directory.
pub const REGISTRY_FILENAME: &str = "registry.json";
const REGISTRY_TMP_FILENAME: &str = ".registry.json.tmp";

/// Current registry file format version
const REGISTRY_VERSION: u32 = 1;

/// Byte-level access to the registry's durable file.
pub trait RegistryStore: Send {
    /// Where the registry lives, for diagnostics.
    fn location(&self) -> &Path;

    /// Full contents, or `None` when nothing has been stored yet.
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the contents so that no reader observes a partial write.
    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Registry file on the local file system.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStore {
    /// Store at `<dir>/registry.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(REGISTRY_FILENAME),
            tmp_path: dir.join(REGISTRY_TMP_FILENAME),
        }
    }
}

impl RegistryStore for FileStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to temp file first, then rename for atomicity
        let file = File::create(&self.tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        fs::rename(&self.tmp_path, &self.path)
    }
}

/// On-disk shape of the registry.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    records: BTreeMap<String, MediaRecord>,
}

/// In-memory snapshot of the registry plus its backing store.
pub struct AliasRegistry {
    store: Box<dyn RegistryStore>,
    records: BTreeMap<String, MediaRecord>,
    /// Aliases handed out by `allocate_alias` but not yet `put`
    reserved: BTreeSet<String>,
    dirty: bool,
}

impl std::fmt::Debug for AliasRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasRegistry")
            .field("location", &self.store.location())
            .field("records", &self.records.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl AliasRegistry {
    /// Load the registry stored in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::load(Box::new(FileStore::in_dir(dir)))
    }

    /// Load from a store. A missing file is an empty registry; a malformed one
    /// is `RegistryCorrupt` and is never repaired here.
    pub fn load(store: Box<dyn RegistryStore>) -> Result<Self> {
        let records = match store.read()? {
            None => {
                debug!(path = %store.location().display(), "no registry yet, starting empty");
                BTreeMap::new()
            }
            Some(bytes) => parse_registry(&bytes, store.location())?,
        };

        Ok(Self {
            store,
            records,
            reserved: BTreeSet::new(),
            dirty: false,
        })
    }

    pub fn location(&self) -> &Path {
        self.store.location()
    }

    pub fn get(&self, alias: &str) -> Option<&MediaRecord> {
        self.records.get(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.records.contains_key(alias)
    }

    /// The record downloaded from `source_ref`, if any. The earliest download wins.
    pub fn find_by_source(&self, source_ref: &str) -> Option<&MediaRecord> {
        self.records
            .values()
            .filter(|r| r.source_ref == source_ref)
            .min_by(|a, b| a.downloaded_at.cmp(&b.downloaded_at))
    }

    /// Fails with `Conflict` if `alias` is bound to a different source and
    /// `overwrite` was not requested.
    pub fn check_put(&self, alias: &str, source_ref: &str, overwrite: bool) -> Result<()> {
        match self.records.get(alias) {
            Some(existing) if existing.source_ref != source_ref && !overwrite => Err(Error::Conflict {
                alias: alias.to_string(),
                existing: existing.source_ref.clone(),
                requested: source_ref.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Insert or replace a record. Returns the record it replaced.
    pub fn put(&mut self, record: MediaRecord, overwrite: bool) -> Result<Option<MediaRecord>> {
        if record.local_path.is_none() {
            return Err(Error::Input(format!(
                "record '{}' has no local path; only completed downloads can be registered",
                record.alias
            )));
        }
        self.check_put(&record.alias, &record.source_ref, overwrite)?;

        self.reserved.remove(&record.alias);
        let alias = record.alias.clone();
        let replaced = self.records.insert(alias.clone(), record);
        self.dirty = true;
        match &replaced {
            Some(old) => info!(alias = %alias, previous = %old.source_ref, "replaced registry record"),
            None => info!(alias = %alias, "registered"),
        }
        Ok(replaced)
    }

    /// Hand out `base`, or `base_2`, `base_3`, ... whichever is first unused.
    /// The result stays reserved until `put` or `release`.
    pub fn allocate_alias(&mut self, base: &str) -> String {
        let mut n = 1u32;
        loop {
            let candidate = alias::with_suffix(base, n);
            if !self.records.contains_key(&candidate) && !self.reserved.contains(&candidate) {
                self.reserved.insert(candidate.clone());
                return candidate;
            }
            n += 1;
        }
    }

    /// Give back an alias from `allocate_alias` that will not be used.
    pub fn release(&mut self, alias: &str) {
        self.reserved.remove(alias);
    }

    /// All records ordered by `downloaded_at` ascending, ties broken by alias.
    pub fn list(&self) -> Vec<&MediaRecord> {
        let mut records: Vec<&MediaRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.downloaded_at
                .cmp(&b.downloaded_at)
                .then_with(|| a.alias.cmp(&b.alias))
        });
        records
    }

    pub fn remove(&mut self, alias: &str) -> Result<MediaRecord> {
        let removed = self
            .records
            .remove(alias)
            .ok_or_else(|| Error::NotFound(format!("no alias '{alias}' in registry")))?;
        self.dirty = true;
        info!(alias = %alias, "removed from registry");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether there are in-memory changes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the snapshot atomically.
    pub fn flush(&mut self) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            records: self.records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(io::Error::from)?;
        self.store.write_atomic(&bytes)?;
        self.dirty = false;
        debug!(path = %self.store.location().display(), records = self.records.len(), "registry flushed");
        Ok(())
    }
}

fn parse_registry(bytes: &[u8], path: &Path) -> Result<BTreeMap<String, MediaRecord>> {
    let corrupt = |reason: String| Error::RegistryCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file: RegistryFile = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    if file.version != REGISTRY_VERSION {
        return Err(corrupt(format!("unsupported registry version {}", file.version)));
    }
    for (key, record) in &file.records {
        if key != &record.alias {
            return Err(corrupt(format!("entry '{}' holds record for alias '{}'", key, record.alias)));
        }
        if record.local_path.is_none() {
            return Err(corrupt(format!("entry '{key}' has no local path")));
        }
    }
    Ok(file.records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Metadata;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(alias: &str, source: &str) -> MediaRecord {
        let mut meta = Metadata::new();
        meta.insert("title".into(), json!(format!("Title of {alias}")));
        MediaRecord::new(alias, source, PathBuf::from(format!("{alias}/{alias}.mp4")), "best", meta)
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        let rec = record("a", "https://example.com/a");
        reg.put(rec.clone(), false).unwrap();
        assert_eq!(reg.get("a"), Some(&rec));
        assert!(reg.is_dirty());
    }

    #[test]
    fn test_put_conflict_without_overwrite() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("a", "https://example.com/a"), false).unwrap();

        let err = reg.put(record("a", "https://example.com/other"), false).unwrap_err();
        assert!(matches!(err, Error::Conflict { ref alias, .. } if alias == "a"));
        assert_eq!(reg.get("a").unwrap().source_ref, "https://example.com/a");

        let replaced = reg.put(record("a", "https://example.com/other"), true).unwrap();
        assert_eq!(replaced.unwrap().source_ref, "https://example.com/a");
        assert_eq!(reg.get("a").unwrap().source_ref, "https://example.com/other");
    }

    #[test]
    fn test_same_source_replaces() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        let mut first = record("a", "u");
        first.downloaded_at = Utc::now() - Duration::hours(1);
        reg.put(first.clone(), false).unwrap();

        let second = record("a", "u");
        reg.put(second.clone(), false).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.get("a").unwrap().downloaded_at > first.downloaded_at);
    }

    #[test]
    fn test_put_refuses_unmaterialized() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        let mut rec = record("a", "u");
        rec.local_path = None;
        assert!(matches!(reg.put(rec, false), Err(Error::Input(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_allocate_alias_suffixes() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("clip", "u"), false).unwrap();

        assert_eq!(reg.allocate_alias("clip"), "clip_2");
        assert_eq!(reg.allocate_alias("clip"), "clip_3");
        assert_eq!(reg.allocate_alias("fresh"), "fresh");
    }

    #[test]
    fn test_release_returns_alias() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        let a = reg.allocate_alias("x");
        reg.release(&a);
        assert_eq!(reg.allocate_alias("x"), "x");
    }

    #[test]
    fn test_flush_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("a", "u1"), false).unwrap();
        reg.put(record("b", "u2").with_playlist_index(2), false).unwrap();
        reg.flush().unwrap();
        assert!(!reg.is_dirty());
        assert!(!dir.path().join(REGISTRY_TMP_FILENAME).exists());

        let loaded = AliasRegistry::open(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("a"), reg.get("a"));
        assert_eq!(loaded.get("b"), reg.get("b"));
        assert_eq!(loaded.get("b").unwrap().playlist_index, Some(2));
    }

    #[test]
    fn test_float_metadata_survives_reload_exactly() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();

        let mut durations = vec![1806.6818980003497, 0.1 + 0.2, 1.0 / 3.0];
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..500 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            durations.push((state >> 11) as f64 / (1u64 << 53) as f64 * 7200.0);
        }
        for (i, duration) in durations.iter().enumerate() {
            let mut rec = record(&format!("r{i}"), &format!("https://x/{i}"));
            rec.metadata.insert("duration".into(), json!(duration));
            reg.put(rec, false).unwrap();
        }
        reg.flush().unwrap();

        let loaded = AliasRegistry::open(dir.path()).unwrap();
        for (i, duration) in durations.iter().enumerate() {
            let got = loaded.get(&format!("r{i}")).unwrap().duration();
            assert_eq!(got.map(f64::to_bits), Some(duration.to_bits()), "record r{i}");
        }
    }

    #[test]
    fn test_list_orders_by_download_time() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (alias, offset) in [("zeta", 0), ("alpha", 2), ("mid", 1)] {
            let mut rec = record(alias, alias);
            rec.downloaded_at = t1 + Duration::minutes(offset);
            reg.put(rec, false).unwrap();
        }
        let order: Vec<&str> = reg.list().iter().map(|r| r.alias.as_str()).collect();
        assert_eq!(order, ["zeta", "mid", "alpha"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let reg = AliasRegistry::open(&dir.path().join("not-yet")).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_malformed_file_is_corrupt() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(REGISTRY_FILENAME), b"{ not json").unwrap();
        let err = AliasRegistry::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::RegistryCorrupt { .. }));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(REGISTRY_FILENAME), br#"{"version": 99, "records": {}}"#).unwrap();
        assert!(matches!(AliasRegistry::open(dir.path()), Err(Error::RegistryCorrupt { .. })));
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut records = BTreeMap::new();
        records.insert("other".to_string(), record("a", "u"));
        let bytes = serde_json::to_vec(&RegistryFile { version: REGISTRY_VERSION, records }).unwrap();
        fs::write(dir.path().join(REGISTRY_FILENAME), bytes).unwrap();
        assert!(matches!(AliasRegistry::open(dir.path()), Err(Error::RegistryCorrupt { .. })));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("a", "u"), false).unwrap();
        reg.remove("a").unwrap();
        assert!(reg.get("a").is_none());
        assert!(matches!(reg.remove("a"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_unflushed_changes_are_not_durable() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("a", "u"), false).unwrap();
        reg.flush().unwrap();
        reg.put(record("b", "u2"), false).unwrap();
        drop(reg);

        let loaded = AliasRegistry::open(dir.path()).unwrap();
        assert!(loaded.contains("a"));
        assert!(!loaded.contains("b"));
    }

    #[test]
    fn test_find_by_source() {
        let dir = tempdir().unwrap();
        let mut reg = AliasRegistry::open(dir.path()).unwrap();
        reg.put(record("a", "https://x/1"), false).unwrap();
        assert_eq!(reg.find_by_source("https://x/1").unwrap().alias, "a");
        assert!(reg.find_by_source("https://x/2").is_none());
    }
}
