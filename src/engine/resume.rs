//! Resume checker
//!
//! Inspects what a previous run left on disk and classifies every planned
//! file as complete, corrupted, partial, or absent. Partial files are
//! truncated back to the last chunk boundary whose content still matches
//! the chunks manifest, so the downloader only ever appends verified
//! data. After the sweep each file either matches its manifest hash or
//! ends exactly on a verified chunk boundary.

use super::plan::{FileInfo, InstallPlan};
use super::EngineError;
use crate::hash::{sha256_file, verify_chunk};
use crate::manifest::{ChunkRecord, MAX_CHUNK};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ResumeState {
    /// Files already fully present and hash-valid; not downloaded again.
    pub completed: HashSet<u32>,
    /// Files present with the right size but the wrong hash; fully
    /// re-downloaded from chunk 0.
    pub corrupted: HashSet<u32>,
    /// First chunk ordinal each file still needs.
    pub start_chunk: HashMap<u32, u32>,
    /// Verified bytes already on disk, credited to progress.
    pub bytes_already_downloaded: u64,
    pub files_already_complete: u32,
}

impl ResumeState {
    pub fn start_chunk(&self, index: u32) -> u32 {
        self.start_chunk.get(&index).copied().unwrap_or(0)
    }

    /// A partial file truncated to a verified boundary: the writer may
    /// open it in append mode.
    pub fn is_clean_partial(&self, index: u32) -> bool {
        self.start_chunk(index) > 0 && !self.corrupted.contains(&index)
    }
}

enum FileClass {
    Absent,
    Completed,
    Corrupted,
    Partial { start: u32 },
}

async fn truncate_to(path: &Path, len: u64) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await
}

/// Count how many leading on-disk chunks match the manifest SHAs.
async fn count_valid_chunks(
    path: &Path,
    chunks: &[ChunkRecord],
    complete_chunks: u32,
) -> Result<u32, EngineError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; MAX_CHUNK as usize];
    for i in 0..complete_chunks {
        file.read_exact(&mut buf).await?;
        let expected = match chunks.get(i as usize) {
            Some(chunk) => chunk.sha(),
            None => return Ok(i),
        };
        if !verify_chunk(&buf, expected) {
            return Ok(i);
        }
    }
    Ok(complete_chunks)
}

async fn classify_file(info: &FileInfo, chunks: &[ChunkRecord]) -> Result<FileClass, EngineError> {
    let metadata = match tokio::fs::metadata(&info.full_path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FileClass::Absent),
        Err(e) => return Err(e.into()),
    };

    let on_disk = metadata.len();
    let expected = info.record.size_bytes;

    if on_disk == expected {
        let path = info.full_path.clone();
        let hash = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .expect("hashing task panicked")?;
        return Ok(if hash.eq_ignore_ascii_case(&info.record.file_sha256) {
            FileClass::Completed
        } else {
            FileClass::Corrupted
        });
    }

    if on_disk > expected {
        // Cannot be a prefix of the expected content.
        return Ok(FileClass::Corrupted);
    }

    // Partial file: cut back to a chunk boundary, then keep only the
    // prefix of chunks that still verifies.
    let complete_chunks = (on_disk / MAX_CHUNK) as u32;
    if complete_chunks == 0 {
        tokio::fs::remove_file(&info.full_path).await?;
        return Ok(FileClass::Absent);
    }
    if on_disk % MAX_CHUNK != 0 {
        debug!(
            "truncating {} to chunk boundary {}",
            info.full_path.display(),
            complete_chunks
        );
        truncate_to(&info.full_path, complete_chunks as u64 * MAX_CHUNK).await?;
    }

    let valid = count_valid_chunks(&info.full_path, chunks, complete_chunks).await?;
    if valid == 0 {
        tokio::fs::remove_file(&info.full_path).await?;
        return Ok(FileClass::Absent);
    }
    if valid < complete_chunks {
        truncate_to(&info.full_path, valid as u64 * MAX_CHUNK).await?;
    }
    Ok(FileClass::Partial { start: valid })
}

/// Sweep all planned files in parallel (up to `workers`) and build the
/// resume state for this run.
pub async fn check_existing(
    plan: &InstallPlan,
    chunks: &HashMap<u32, Vec<ChunkRecord>>,
    workers: usize,
) -> Result<ResumeState, EngineError> {
    let classified: Vec<(u32, u64, Result<FileClass, EngineError>)> =
        stream::iter(plan.files.values())
            .map(|info| {
                let file_chunks = chunks.get(&info.index);
                async move {
                    let empty = Vec::new();
                    let class = classify_file(info, file_chunks.unwrap_or(&empty)).await;
                    (info.index, info.record.size_bytes, class)
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

    let mut resume = ResumeState::default();
    for (index, size_bytes, class) in classified {
        match class? {
            FileClass::Absent => {
                resume.start_chunk.insert(index, 0);
            }
            FileClass::Completed => {
                resume.completed.insert(index);
                resume.bytes_already_downloaded += size_bytes;
                resume.files_already_complete += 1;
            }
            FileClass::Corrupted => {
                resume.corrupted.insert(index);
                resume.start_chunk.insert(index, 0);
            }
            FileClass::Partial { start } => {
                resume.start_chunk.insert(index, start);
                resume.bytes_already_downloaded += start as u64 * MAX_CHUNK;
            }
        }
    }

    if resume.files_already_complete > 0 || !resume.start_chunk.is_empty() {
        info!(
            "resume: {} complete, {} corrupt, {} partial or absent",
            resume.files_already_complete,
            resume.corrupted.len(),
            resume.start_chunk.len()
        );
    }
    Ok(resume)
}
