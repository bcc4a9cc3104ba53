//! Walks a workspace and reconciles the inventory with the filesystem,
//! classifying every entry as UPDATE/DELETE/NONE.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use walkdir::WalkDir;

use crate::inventory::{format_mtime, md5_of_file, mtime_secs, FileEntryUpdate, Inventory, SyncState};

/// True if `path` is a regular file, following one level of symlink
/// resolution: a symlink that resolves to a regular file counts, a broken
/// symlink does not.
fn is_file_or_resolved_symlink(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => path.is_file(),
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

/// Recursively enumerate every regular file (and symlink resolving to one)
/// under `workspace`, excluding any directory named `.git`, and return
/// workspace-relative forward-separated paths.
pub fn list_files(workspace: &Path) -> Vec<String> {
    WalkDir::new(workspace)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| is_file_or_resolved_symlink(e.path()))
        .filter_map(|e| {
            e.path()
                .strip_prefix(workspace)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

/// Mutate `inventory` in place to reflect the current state of `workspace`
///. Returns the number of paths that changed classification.
pub fn rescan(workspace: &Path, inventory: &mut Inventory) -> Result<usize> {
    let current = list_files(workspace);
    let mut changes = 0usize;

    for rel_path in &current {
        let abs_path = workspace.join(rel_path);
        if !inventory.has(rel_path) {
            inventory.add(rel_path, &abs_path)?;
            changes += 1;
            continue;
        }

        let meta = match std::fs::symlink_metadata(&abs_path) {
            Ok(m) => m,
            Err(_) => {
                inventory.update(rel_path, FileEntryUpdate::required_sync(SyncState::Delete))?;
                changes += 1;
                continue;
            }
        };
        if !abs_path.is_file() {
            // broken symlink or a race where the path stopped being a regular file
            inventory.update(rel_path, FileEntryUpdate::required_sync(SyncState::Delete))?;
            changes += 1;
            continue;
        }

        let last_modify = mtime_secs(&std::fs::metadata(&abs_path)?)?;
        let prev = inventory.get(rel_path).expect("checked has() above");
        if last_modify != prev.last_modify {
            let _ = meta;
            inventory.update(
                rel_path,
                FileEntryUpdate {
                    required_sync: Some(SyncState::Update),
                    md5: Some(md5_of_file(&abs_path)?),
                    size: Some(std::fs::metadata(&abs_path)?.len()),
                    last_modify: Some(last_modify),
                    last_modify_formatted: Some(format_mtime(last_modify)),
                },
            )?;
            changes += 1;
        }
    }

    let seen: HashSet<&str> = current.iter().map(|s| s.as_str()).collect();
    let known: Vec<String> = inventory.all_entries().keys().cloned().collect();
    for rel_path in known {
        if !seen.contains(rel_path.as_str()) {
            inventory.update(&rel_path, FileEntryUpdate::required_sync(SyncState::Delete))?;
            changes += 1;
        }
    }

    Ok(changes)
}
