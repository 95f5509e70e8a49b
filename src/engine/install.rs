//! Install driver
//!
//! Runs one title through the whole pipeline: fetch and cache both
//! manifests, plan the tree, reconcile with whatever a previous run left
//! on disk, download and assemble, then finalize and record the install.
//! Cancellation anywhere in the middle leaves resumable state behind.

use super::download::{run_download, ChunkSource};
use super::fetch::ChunkFetcher;
use super::plan::{group_chunks, plan_install};
use super::progress::ProgressTracker;
use super::resume::{check_existing, ResumeState};
use super::{EngineError, RunOptions};
use crate::library::{self, InstallRecord, ManifestKind};
use crate::manifest::{
    build_manifest_url, chunks_manifest_url, parse_build_manifest, parse_chunks_manifest,
    BuildRecord, ChunkRecord,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything needed to address one version of one title.
#[derive(Debug, Clone)]
pub struct InstallTarget {
    pub slug: String,
    pub source: ChunkSource,
    pub version: String,
    pub install_path: PathBuf,
}

impl InstallTarget {
    fn build_manifest_url(&self, version: &str) -> String {
        build_manifest_url(
            &self.source.cdn_base,
            &self.source.namespace,
            &self.source.id_key,
            self.source.os,
            version,
        )
    }

    fn chunks_manifest_url(&self, version: &str) -> String {
        chunks_manifest_url(
            &self.source.cdn_base,
            &self.source.namespace,
            &self.source.id_key,
            self.source.os,
            version,
        )
    }
}

/// What `install` has to report back to the CLI.
#[derive(Debug)]
pub enum InstallReport {
    /// `--info`: nothing was touched.
    Info { download_bytes: u64, file_count: u32 },
    Installed { bytes_written: u64, file_count: u32 },
}

/// Fetch a manifest from the CDN and cache the raw bytes.
pub(crate) async fn fetch_and_cache_manifest(
    fetcher: &ChunkFetcher,
    cancel: &CancellationToken,
    target: &InstallTarget,
    version: &str,
    kind: ManifestKind,
) -> anyhow::Result<Vec<u8>> {
    let url = match kind {
        ManifestKind::Build => target.build_manifest_url(version),
        ManifestKind::Chunks => target.chunks_manifest_url(version),
    };
    let bytes = fetcher.fetch(cancel, &url).await?;
    library::store_manifest(&target.slug, version, kind, &bytes)?;
    Ok(bytes.to_vec())
}

/// Plan, resume-check, and run the download pipeline over a record set.
/// Shared between install and update.
pub(crate) async fn run_pipeline(
    fetcher: Arc<ChunkFetcher>,
    records: &[BuildRecord],
    chunk_records: &[ChunkRecord],
    source: &ChunkSource,
    install_path: &Path,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> Result<(u64, u32), EngineError> {
    info!("planning installation into {}", install_path.display());
    let plan = plan_install(records, install_path).await?;
    let grouped = group_chunks(&plan, chunk_records)?;

    let any_on_disk = plan.files.values().any(|f| f.full_path.exists());
    let resume = if any_on_disk {
        check_existing(&plan, &grouped, opts.workers).await?
    } else {
        ResumeState::default()
    };

    // Completed files drop out entirely; partial files keep only the
    // chunks past their verified prefix, renumbered from zero.
    let mut reduced: HashMap<u32, Vec<ChunkRecord>> = HashMap::new();
    for (index, chunks) in grouped {
        if resume.completed.contains(&index) {
            continue;
        }
        let start = (resume.start_chunk(index) as usize).min(chunks.len());
        reduced.insert(index, chunks[start..].to_vec());
    }

    let progress = Arc::new(if opts.show_progress {
        ProgressTracker::with_bars(plan.total_bytes, plan.total_files)
    } else {
        ProgressTracker::new(plan.total_bytes, plan.total_files)
    });
    progress.pre_credit(resume.bytes_already_downloaded, resume.files_already_complete);

    info!(
        "downloading {} files ({} bytes already on disk)",
        plan.total_files - resume.files_already_complete,
        resume.bytes_already_downloaded
    );
    let result = run_download(
        fetcher,
        Arc::new(source.clone()),
        &plan,
        &reduced,
        &resume,
        progress.clone(),
        opts,
        cancel.clone(),
    )
    .await;
    progress.finish();
    result?;

    let snapshot = progress.snapshot();
    Ok((snapshot.bytes_written, snapshot.files_completed))
}

/// Install one version of a title.
pub async fn install(
    target: &InstallTarget,
    opts: &RunOptions,
    info_only: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<InstallReport> {
    let fetcher = Arc::new(ChunkFetcher::new(opts.workers)?);

    let build_bytes =
        fetch_and_cache_manifest(&fetcher, cancel, target, &target.version, ManifestKind::Build)
            .await?;
    let records = parse_build_manifest(&build_bytes).map_err(EngineError::Manifest)?;

    if info_only {
        let download_bytes: u64 = records
            .iter()
            .filter(|r| !r.is_directory())
            .map(|r| r.size_bytes)
            .sum();
        let file_count = records.iter().filter(|r| !r.is_directory()).count() as u32;
        return Ok(InstallReport::Info {
            download_bytes,
            file_count,
        });
    }

    let chunks_bytes =
        fetch_and_cache_manifest(&fetcher, cancel, target, &target.version, ManifestKind::Chunks)
            .await?;
    let chunk_records = parse_chunks_manifest(&chunks_bytes).map_err(EngineError::Manifest)?;

    let (bytes_written, file_count) = run_pipeline(
        fetcher,
        &records,
        &chunk_records,
        &target.source,
        &target.install_path,
        opts,
        cancel,
    )
    .await?;

    finalize(target)?;

    Ok(InstallReport::Installed {
        bytes_written,
        file_count,
    })
}

/// Post-download steps shared by install and update: platform fixups,
/// then commit the install record.
pub(crate) fn finalize(target: &InstallTarget) -> anyhow::Result<()> {
    info!("finalizing {}", target.slug);
    #[cfg(target_os = "macos")]
    if target.source.os == crate::manifest::BuildOs::Mac {
        super::mac::mark_bundles_executable(&target.install_path)?;
    }

    library::put_install_record(
        &target.slug,
        InstallRecord {
            install_path: target.install_path.clone(),
            version: target.version.clone(),
            os: target.source.os,
            installed_at: Utc::now(),
        },
    )
}
