//! Persistent per-workspace file inventory: path -> metadata, with the
//! pending-sync subset projected out at save time.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

const MD5_CHUNK_SIZE: usize = 64 * 1024;

/// Pending-sync intent toward the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "NONE")]
    None,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Update => "UPDATE",
            SyncState::Delete => "DELETE",
            SyncState::None => "NONE",
        }
    }
}

/// One tracked relative path in a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub md5: String,
    pub size: u64,
    pub last_modify: f64,
    pub last_modify_formatted: String,
    pub required_sync: SyncState,
    pub version: u64,
}

/// Fields an `update` call may overwrite on an existing entry.
#[derive(Debug, Clone, Default)]
pub struct FileEntryUpdate {
    pub md5: Option<String>,
    pub size: Option<u64>,
    pub last_modify: Option<f64>,
    pub last_modify_formatted: Option<String>,
    pub required_sync: Option<SyncState>,
}

impl FileEntryUpdate {
    pub fn required_sync(state: SyncState) -> Self {
        Self {
            required_sync: Some(state),
            ..Default::default()
        }
    }
}

/// Compute the md5 digest of a file, streaming in chunks so memory stays
/// bounded regardless of file size.
pub fn md5_of_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("reading {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; MD5_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

pub fn format_mtime(seconds: f64) -> String {
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds.fract()) * 1e9).round() as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(dt) => dt
            .with_timezone(&Local)
            .format("%a %b %e %T %Y")
            .to_string(),
        None => String::new(),
    }
}

pub fn mtime_secs(meta: &fs::Metadata) -> Result<f64> {
    let modified = meta.modified()?;
    let dur = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(dur.as_secs_f64())
}

/// Mapping of workspace-relative path to `FileEntry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(flatten)]
    entries: BTreeMap<String, FileEntry>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an inventory from `path`. An absent file is an empty inventory;
    /// a malformed file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::new());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        if data.trim().is_empty() {
            return Ok(Self::new());
        }
        let entries: BTreeMap<String, FileEntry> = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing inventory {}", path.display()))?;
        Ok(Self { entries })
    }

    /// Write the full inventory to `path` and the pending subset to the
    /// sibling `<path without .yml>_to_update.yml`, each atomically via a
    /// temp-file-and-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.entries)?;
        write_atomic(&pending_path(path), &self.pending_entries_map())?;
        Ok(())
    }

    pub fn has(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn all_entries(&self) -> &BTreeMap<String, FileEntry> {
        &self.entries
    }

    pub fn pending_entries(&self) -> BTreeMap<String, FileEntry> {
        self.pending_entries_map()
    }

    fn pending_entries_map(&self) -> BTreeMap<String, FileEntry> {
        self.entries
            .iter()
            .filter(|(_, e)| e.required_sync != SyncState::None)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert a brand-new entry computed from the file at `abs_path`,
    /// pending an `UPDATE`.
    pub fn add(&mut self, rel_path: &str, abs_path: &Path) -> Result<()> {
        let meta = fs::metadata(abs_path)
            .with_context(|| format!("stat {}", abs_path.display()))?;
        let last_modify = mtime_secs(&meta)?;
        let entry = FileEntry {
            md5: md5_of_file(abs_path)?,
            size: meta.len(),
            last_modify,
            last_modify_formatted: format_mtime(last_modify),
            required_sync: SyncState::Update,
            version: 0,
        };
        self.entries.insert(rel_path.to_string(), entry);
        Ok(())
    }

    /// Merge `fields` into the entry at `path`, bump `version`, and keep
    /// pending-set membership implicit (it is derived at save time).
    pub fn update(&mut self, path: &str, fields: FileEntryUpdate) -> Result<()> {
        let entry = self
            .entries
            .get_mut(path)
            .with_context(|| format!("update of unknown path '{path}'"))?;
        if let Some(md5) = fields.md5 {
            entry.md5 = md5;
        }
        if let Some(size) = fields.size {
            entry.size = size;
        }
        if let Some(lm) = fields.last_modify {
            entry.last_modify = lm;
        }
        if let Some(lmf) = fields.last_modify_formatted {
            entry.last_modify_formatted = lmf;
        }
        if let Some(rs) = fields.required_sync {
            entry.required_sync = rs;
        }
        entry.version += 1;
        Ok(())
    }

    pub fn remove(&mut self, path: &str) {
        self.entries.remove(path);
    }
}

fn pending_path(path: &Path) -> std::path::PathBuf {
    let s = path.to_string_lossy();
    if let Some(stripped) = s.strip_suffix(".yml") {
        std::path::PathBuf::from(format!("{stripped}_to_update.yml"))
    } else {
        std::path::PathBuf::from(format!("{s}_to_update.yml"))
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    let yaml = serde_yaml::to_string(value)?;
    fs::write(&tmp, yaml).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {} onto {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn add_then_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let abs = write_file(dir.path(), "a.txt", b"hello\n");

        let mut inv = Inventory::new();
        inv.add("a.txt", &abs).unwrap();

        let cache_path = dir.path().join("cache.yml");
        inv.save(&cache_path).unwrap();

        let loaded = Inventory::load(&cache_path).unwrap();
        assert_eq!(loaded.get("a.txt"), inv.get("a.txt"));
        assert_eq!(loaded.all_entries().len(), 1);
    }

    #[test]
    fn pending_file_only_contains_non_none_entries() {
        let dir = tempdir().unwrap();
        let abs = write_file(dir.path(), "a.txt", b"hello\n");

        let mut inv = Inventory::new();
        inv.add("a.txt", &abs).unwrap();
        inv.update("a.txt", FileEntryUpdate::required_sync(SyncState::None))
            .unwrap();

        let cache_path = dir.path().join("cache.yml");
        inv.save(&cache_path).unwrap();

        let pending = Inventory::load(&pending_path(&cache_path)).unwrap();
        assert!(pending.all_entries().is_empty());
    }

    #[test]
    fn update_increments_version_monotonically() {
        let dir = tempdir().unwrap();
        let abs = write_file(dir.path(), "a.txt", b"hello\n");

        let mut inv = Inventory::new();
        inv.add("a.txt", &abs).unwrap();
        assert_eq!(inv.get("a.txt").unwrap().version, 0);

        for _ in 0..3 {
            inv.update("a.txt", FileEntryUpdate::required_sync(SyncState::Update))
                .unwrap();
        }
        assert_eq!(inv.get("a.txt").unwrap().version, 3);
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = tempdir().unwrap();
        let abs = write_file(dir.path(), "a.txt", b"hello\n");
        let mut inv = Inventory::new();
        inv.add("a.txt", &abs).unwrap();
        inv.remove("a.txt");
        assert!(!inv.has("a.txt"));
    }

    #[test]
    fn empty_file_hashes_to_md5_of_empty_input() {
        let dir = tempdir().unwrap();
        let abs = write_file(dir.path(), "empty.txt", b"");
        let digest = md5_of_file(&abs).unwrap();
        assert_eq!(digest, format!("{:x}", md5::Context::new().compute()));
    }
}
