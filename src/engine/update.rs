//! Delta applier: the update driver
//!
//! Diffs the cached old build manifest against the new one, cleans up
//! what the delta removes or replaces, then drives the ordinary install
//! pipeline over just the added and modified files. The old manifest
//! stays cached until the new install record is committed, so an
//! interrupted update can be told apart from a fresh one on rerun.

use super::delta::{compute_delta, DeltaManifest};
use super::fetch::ChunkFetcher;
use super::install::{fetch_and_cache_manifest, finalize, run_pipeline, InstallTarget};
use super::{EngineError, RunOptions};
use crate::library::{self, ManifestKind};
use crate::manifest::{host_path, parse_build_manifest, parse_chunks_manifest, BuildRecord, ChunkRecord};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
pub enum UpdateReport {
    /// The two manifests are identical.
    NoChanges,
    /// `--info`: byte sums only, nothing touched.
    Info {
        download_bytes: u64,
        removed_bytes: u64,
        added: usize,
        modified: usize,
        removed: usize,
    },
    Updated {
        bytes_written: u64,
        file_count: u32,
    },
}

async fn remove_entry(path: &Path, is_directory: bool) -> std::io::Result<()> {
    let result = if is_directory {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Detect a rerun of an interrupted update. An added file already on
/// disk, or a modified file whose size no longer matches the old
/// manifest, means a previous run got partway through writing new
/// content — its partial files must survive cleanup so the resume
/// checker can pick them up.
fn is_interrupted_update(
    delta: &DeltaManifest,
    old_sizes: &HashMap<String, u64>,
    install_path: &Path,
) -> bool {
    for record in &delta.added {
        if !record.is_directory() && host_path(install_path, &record.file_path).exists() {
            return true;
        }
    }
    for record in &delta.modified {
        let full_path = host_path(install_path, &record.file_path);
        if let Ok(metadata) = std::fs::metadata(&full_path) {
            if old_sizes.get(&record.file_path) != Some(&metadata.len()) {
                return true;
            }
        }
    }
    false
}

async fn delete_modified(delta: &DeltaManifest, install_path: &Path) -> std::io::Result<()> {
    for record in &delta.modified {
        remove_entry(&host_path(install_path, &record.file_path), false).await?;
    }
    Ok(())
}

async fn delete_removed(delta: &DeltaManifest, install_path: &Path) -> std::io::Result<()> {
    for record in &delta.removed {
        remove_entry(
            &host_path(install_path, &record.file_path),
            record.is_directory(),
        )
        .await?;
    }
    Ok(())
}

/// Update an installed title from `old_version` to `target.version`.
pub async fn update(
    target: &InstallTarget,
    old_version: &str,
    opts: &RunOptions,
    info_only: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<UpdateReport> {
    let fetcher = Arc::new(ChunkFetcher::new(opts.workers)?);

    let old_bytes = match library::read_manifest(&target.slug, old_version, ManifestKind::Build)? {
        Some(bytes) => bytes,
        None => {
            info!("old manifest not cached, fetching {}", old_version);
            fetch_and_cache_manifest(&fetcher, cancel, target, old_version, ManifestKind::Build)
                .await?
        }
    };
    let new_bytes =
        fetch_and_cache_manifest(&fetcher, cancel, target, &target.version, ManifestKind::Build)
            .await?;

    let old_records = parse_build_manifest(&old_bytes).map_err(EngineError::Manifest)?;
    let new_records = parse_build_manifest(&new_bytes).map_err(EngineError::Manifest)?;

    let delta = compute_delta(&old_records, &new_records);
    if delta.is_empty() {
        return Ok(UpdateReport::NoChanges);
    }
    info!(
        "delta {} -> {}: {} added, {} modified, {} removed",
        old_version,
        target.version,
        delta.added.len(),
        delta.modified.len(),
        delta.removed.len()
    );

    if info_only {
        return Ok(UpdateReport::Info {
            download_bytes: delta.download_bytes(),
            removed_bytes: delta.removed_bytes(),
            added: delta.added.len(),
            modified: delta.modified.len(),
            removed: delta.removed.len(),
        });
    }

    let old_sizes: HashMap<String, u64> = old_records
        .iter()
        .map(|r| (r.file_path.clone(), r.size_bytes))
        .collect();
    if is_interrupted_update(&delta, &old_sizes, &target.install_path) {
        info!("previous update was interrupted; keeping partial files for resume");
    } else {
        delete_modified(&delta, &target.install_path).await?;
    }
    delete_removed(&delta, &target.install_path).await?;

    let chunks_bytes =
        fetch_and_cache_manifest(&fetcher, cancel, target, &target.version, ManifestKind::Chunks)
            .await?;
    let all_chunks = parse_chunks_manifest(&chunks_bytes).map_err(EngineError::Manifest)?;

    let changed_paths: HashSet<&str> = delta
        .added
        .iter()
        .chain(delta.modified.iter())
        .filter(|r| !r.is_directory() && !r.is_empty())
        .map(|r| r.file_path.as_str())
        .collect();
    let chunk_subset: Vec<ChunkRecord> = all_chunks
        .into_iter()
        .filter(|c| changed_paths.contains(c.file_path.as_str()))
        .collect();

    let subset: Vec<BuildRecord> = delta
        .added
        .iter()
        .chain(delta.modified.iter())
        .cloned()
        .collect();

    let (bytes_written, file_count) = run_pipeline(
        fetcher,
        &subset,
        &chunk_subset,
        &target.source,
        &target.install_path,
        opts,
        cancel,
    )
    .await?;

    finalize(target)?;

    Ok(UpdateReport::Updated {
        bytes_written,
        file_count,
    })
}
