//! Delta computation between two build manifests
//!
//! Indexes both manifests by path and splits the difference into added,
//! modified, and removed record lists. Directories never appear as
//! modified; they are only created or removed.

use crate::manifest::BuildRecord;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct DeltaManifest {
    /// Records (files or directories) present only in the new manifest.
    pub added: Vec<BuildRecord>,
    /// Files in both manifests whose content hash changed. Carries the
    /// new manifest's record.
    pub modified: Vec<BuildRecord>,
    /// Records present only in the old manifest.
    pub removed: Vec<BuildRecord>,
}

impl DeltaManifest {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Bytes that have to be downloaded to apply this delta.
    pub fn download_bytes(&self) -> u64 {
        self.added
            .iter()
            .chain(self.modified.iter())
            .map(|r| r.size_bytes)
            .sum()
    }

    /// Bytes freed by removed entries.
    pub fn removed_bytes(&self) -> u64 {
        self.removed.iter().map(|r| r.size_bytes).sum()
    }
}

/// Diff two build manifests. For every path the result names it in at
/// most one of the three lists.
pub fn compute_delta(old: &[BuildRecord], new: &[BuildRecord]) -> DeltaManifest {
    let old_by_path: HashMap<&str, &BuildRecord> =
        old.iter().map(|r| (r.file_path.as_str(), r)).collect();
    let new_paths: HashSet<&str> = new.iter().map(|r| r.file_path.as_str()).collect();

    let mut delta = DeltaManifest::default();

    for record in new {
        match old_by_path.get(record.file_path.as_str()) {
            None => delta.added.push(record.clone()),
            Some(old_record) => {
                // Directories only participate in added/removed.
                if record.is_directory() || old_record.is_directory() {
                    continue;
                }
                if !record
                    .file_sha256
                    .eq_ignore_ascii_case(&old_record.file_sha256)
                {
                    delta.modified.push(record.clone());
                }
            }
        }
    }

    for record in old {
        if !new_paths.contains(record.file_path.as_str()) {
            delta.removed.push(record.clone());
        }
    }

    delta
}
