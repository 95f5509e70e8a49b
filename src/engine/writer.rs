//! Ordered writer: single consumer of the results channel
//!
//! Workers finish chunks in whatever order the network decides; this
//! task re-serializes them per file. Each file keeps a next-expected
//! index and a pending buffer; chunks are flushed strictly in order with
//! one handle per file. The writer is also where memory reservations
//! return to the gate, which keeps release ordering deterministic.

use super::memory::MemoryGate;
use super::progress::ProgressTracker;
use super::EngineError;
use crate::manifest::MAX_CHUNK;
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one chunk job, emitted by a download worker.
#[derive(Debug)]
pub struct ChunkResult {
    pub file_index: u32,
    /// Index within this run's job stream for the file (0-based even for
    /// resumed partial files).
    pub chunk_index: u32,
    /// Chunk bytes, or the failure that should end the run. Workers
    /// release their memory reservation before emitting an error, so
    /// only `Ok` results carry one.
    pub payload: Result<Bytes, EngineError>,
}

/// Per-file instructions for the writer.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub path: PathBuf,
    /// Chunks expected from this run (already reduced for resume).
    pub total: u32,
    /// Open in append mode: the resume checker left a verified prefix.
    pub append: bool,
}

struct FileWriteState {
    file: File,
    pending: HashMap<u32, Bytes>,
    next: u32,
    total: u32,
}

async fn open_target(target: &WriteTarget) -> Result<File, EngineError> {
    let file = if target.append {
        OpenOptions::new().append(true).open(&target.path).await?
    } else {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target.path)
            .await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target.path, std::fs::Permissions::from_mode(0o644))
                .await?;
        }
        file
    };
    Ok(file)
}

/// Consume chunk results until the channel closes. Returns when every
/// target file has been written to completion, the run is cancelled, or
/// the first failure surfaces.
pub async fn run(
    mut results: mpsc::Receiver<ChunkResult>,
    targets: HashMap<u32, WriteTarget>,
    gate: &MemoryGate,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let mut remaining = targets;
    let mut states: HashMap<u32, FileWriteState> = HashMap::new();
    let mut first_error: Option<EngineError> = None;

    while let Some(result) = results.recv().await {
        let data = match result.payload {
            Ok(data) => data,
            Err(e) => {
                if first_error.is_none() {
                    // First failure ends the run; everyone else drains.
                    cancel.cancel();
                    first_error = Some(e);
                }
                continue;
            }
        };

        if first_error.is_some() {
            gate.release(MAX_CHUNK);
            continue;
        }

        if let Err(e) = handle_chunk(
            &mut states,
            &mut remaining,
            result.file_index,
            result.chunk_index,
            data,
            gate,
            progress,
        )
        .await
        {
            cancel.cancel();
            first_error = Some(e);
        }
    }

    // Reservations still buffered as out-of-order chunks go back now.
    for state in states.values() {
        gate.release(MAX_CHUNK * state.pending.len() as u64);
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if remaining.is_empty() {
        return Ok(());
    }
    if cancel.is_cancelled() {
        // Interrupted, not failed: on-disk prefixes are all verified.
        return Err(EngineError::Cancelled);
    }
    let (index, target) = remaining
        .iter()
        .min_by_key(|(index, _)| **index)
        .expect("remaining is non-empty");
    Err(EngineError::Incomplete {
        path: target.path.display().to_string(),
        got: states.get(index).map(|s| s.next).unwrap_or(0),
        total: target.total,
    })
}

async fn handle_chunk(
    states: &mut HashMap<u32, FileWriteState>,
    remaining: &mut HashMap<u32, WriteTarget>,
    file_index: u32,
    chunk_index: u32,
    data: Bytes,
    gate: &MemoryGate,
    progress: &ProgressTracker,
) -> Result<(), EngineError> {
    let Some(target) = remaining.get(&file_index) else {
        // A chunk for a file that already completed; nothing to do but
        // return the reservation.
        gate.release(MAX_CHUNK);
        return Ok(());
    };

    let state = match states.entry(file_index) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => match open_target(target).await {
            Ok(file) => entry.insert(FileWriteState {
                file,
                pending: HashMap::new(),
                next: 0,
                total: target.total,
            }),
            Err(e) => {
                gate.release(MAX_CHUNK);
                return Err(e);
            }
        },
    };

    if chunk_index != state.next {
        debug_assert!(chunk_index > state.next, "duplicate chunk delivery");
        state.pending.insert(chunk_index, data);
        return Ok(());
    }

    // In-order arrival: flush it and everything contiguous behind it.
    let mut to_write = data;
    loop {
        let written = to_write.len() as u64;
        let write_result = state.file.write_all(&to_write).await;
        gate.release(MAX_CHUNK);
        write_result?;
        progress.add_written(written);
        state.next += 1;

        match state.pending.remove(&state.next) {
            Some(buffered) => to_write = buffered,
            None => break,
        }
    }

    if state.next == state.total {
        let mut state = states.remove(&file_index).expect("state exists");
        state.file.flush().await?;
        let target = remaining.remove(&file_index).expect("target exists");
        debug!("completed {}", target.path.display());
        progress.file_completed();
    }

    Ok(())
}
