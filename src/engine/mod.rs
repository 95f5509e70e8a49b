//! The chunked content engine
//!
//! Turns a build manifest + chunks manifest + CDN chunk objects into a
//! faithful on-disk installation: planner, resume checker, memory-bounded
//! download orchestrator, ordered writer, delta updater and verifier.

pub mod delta;
pub mod download;
pub mod fetch;
pub mod install;
#[cfg(target_os = "macos")]
pub mod mac;
pub mod memory;
pub mod plan;
pub mod progress;
pub mod resume;
pub mod update;
pub mod verify;
pub mod writer;

use crate::manifest::ManifestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Not a failure: the run was interrupted and on-disk state is
    /// resumable.
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("fetching {url} failed after {attempts} attempt(s): {source}")]
    Fetch {
        url: String,
        attempts: u32,
        #[source]
        source: fetch::FetchError,
    },
    #[error("chunk {chunk_id} of {file_path} failed verification")]
    ChunkCorrupt { chunk_id: String, file_path: String },
    #[error("file {path} incomplete, got {got}/{total} chunks")]
    Incomplete { path: String, got: u32, total: u32 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Tunables for one engine run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub max_memory: u64,
    pub skip_verify: bool,
    /// Draw indicatif bars. Off for `--info` and in tests.
    pub show_progress: bool,
}

/// `min(cpu x 2, 16)` download workers.
pub fn default_workers() -> usize {
    (num_cpus::get() * 2).min(16)
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_memory: crate::config::DEFAULT_MAX_MEMORY,
            skip_verify: false,
            show_progress: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_workers_capped() {
        let workers = default_workers();
        assert!(workers >= 1);
        assert!(workers <= 16);
    }

    #[test]
    fn test_cancelled_is_not_conflated() {
        assert!(EngineError::Cancelled.is_cancelled());
        let err = EngineError::Incomplete {
            path: "a.bin".into(),
            got: 1,
            total: 3,
        };
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "file a.bin incomplete, got 1/3 chunks");
    }
}
