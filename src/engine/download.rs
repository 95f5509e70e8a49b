//! Download orchestrator
//!
//! Wires the fair scheduler, the worker pool, the memory gate, and the
//! ordered writer into one run. Jobs flow through a bounded mpmc channel
//! so workers stay busy without unbounded buffering; results flow through
//! an mpsc channel into the single writer.
//!
//! Scheduling is round-robin across files: each pass offers at most one
//! chunk per file, so no single large file can monopolize the buffered
//! memory budget.

use super::fetch::ChunkFetcher;
use super::memory::MemoryGate;
use super::plan::InstallPlan;
use super::progress::ProgressTracker;
use super::resume::ResumeState;
use super::writer::{self, ChunkResult, WriteTarget};
use super::{EngineError, RunOptions};
use crate::hash::verify_chunk;
use crate::manifest::{chunk_url, extract_sha, BuildOs, ChunkRecord, MAX_CHUNK};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where a run's chunks live on the CDN.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    pub cdn_base: String,
    pub namespace: String,
    pub id_key: String,
    pub os: BuildOs,
}

impl ChunkSource {
    pub fn url(&self, chunk_id: &str) -> String {
        chunk_url(&self.cdn_base, &self.namespace, &self.id_key, self.os, chunk_id)
    }
}

/// One unit of work for a download worker.
#[derive(Debug, Clone)]
struct ChunkJob {
    file_index: u32,
    /// Position in this run's job stream for the file (rebased to 0 for
    /// resumed partial files).
    chunk_index: u32,
    chunk_id: String,
    file_path: String,
}

/// Offer one chunk per file per pass until every queue drains. Stops
/// early on cancellation or when the workers are gone.
async fn schedule_jobs(
    mut queues: Vec<VecDeque<ChunkJob>>,
    jobs: async_channel::Sender<ChunkJob>,
    cancel: CancellationToken,
) {
    'outer: while !queues.is_empty() {
        let mut i = 0;
        while i < queues.len() {
            let job = queues[i].pop_front().expect("drained queues are removed");
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        break 'outer;
                    }
                }
            }
            if queues[i].is_empty() {
                queues.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

async fn worker_loop(
    jobs: async_channel::Receiver<ChunkJob>,
    results: mpsc::Sender<ChunkResult>,
    fetcher: Arc<ChunkFetcher>,
    source: Arc<ChunkSource>,
    gate: Arc<MemoryGate>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    skip_verify: bool,
) {
    loop {
        // Fund the reservation before taking a job. Jobs leave the queue
        // in dispatch order, so every chunk ahead of a buffered one is
        // already funded and in flight; the writer can always make
        // progress even with a single-chunk budget.
        if !gate.acquire(&cancel, MAX_CHUNK).await {
            break;
        }
        let job = match jobs.recv().await {
            Ok(job) => job,
            Err(_) => {
                gate.release(MAX_CHUNK);
                break;
            }
        };

        let url = source.url(&job.chunk_id);
        let data = match fetcher.fetch(&cancel, &url).await {
            Ok(data) => data,
            Err(EngineError::Cancelled) => {
                gate.release(MAX_CHUNK);
                break;
            }
            Err(e) => {
                gate.release(MAX_CHUNK);
                let _ = results
                    .send(ChunkResult {
                        file_index: job.file_index,
                        chunk_index: job.chunk_index,
                        payload: Err(e),
                    })
                    .await;
                continue;
            }
        };

        progress.add_downloaded(data.len() as u64);

        if !skip_verify && !verify_chunk(&data, extract_sha(&job.chunk_id)) {
            gate.release(MAX_CHUNK);
            let _ = results
                .send(ChunkResult {
                    file_index: job.file_index,
                    chunk_index: job.chunk_index,
                    payload: Err(EngineError::ChunkCorrupt {
                        chunk_id: job.chunk_id,
                        file_path: job.file_path,
                    }),
                })
                .await;
            continue;
        }

        let sent = results
            .send(ChunkResult {
                file_index: job.file_index,
                chunk_index: job.chunk_index,
                payload: Ok(data),
            })
            .await;
        if sent.is_err() {
            gate.release(MAX_CHUNK);
            break;
        }
    }
}

/// Run the full fetch-and-assemble pipeline over the given chunk lists.
///
/// `per_file_chunks` must already be reduced for resume: completed files
/// removed, and partial files holding only the chunks still needed, in
/// ascending order.
pub async fn run_download(
    fetcher: Arc<ChunkFetcher>,
    source: Arc<ChunkSource>,
    plan: &InstallPlan,
    per_file_chunks: &HashMap<u32, Vec<ChunkRecord>>,
    resume: &ResumeState,
    progress: Arc<ProgressTracker>,
    opts: &RunOptions,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    // Deterministic rotation order regardless of map iteration.
    let ordered: BTreeMap<u32, &[ChunkRecord]> = per_file_chunks
        .iter()
        .filter(|(index, chunks)| !resume.completed.contains(*index) && !chunks.is_empty())
        .map(|(index, chunks)| (*index, chunks.as_slice()))
        .collect();

    if ordered.is_empty() {
        return Ok(());
    }

    let mut queues: Vec<VecDeque<ChunkJob>> = Vec::with_capacity(ordered.len());
    let mut targets: HashMap<u32, WriteTarget> = HashMap::new();
    for (index, chunks) in &ordered {
        let info = &plan.files[index];
        queues.push(
            chunks
                .iter()
                .enumerate()
                .map(|(position, chunk)| ChunkJob {
                    file_index: *index,
                    chunk_index: position as u32,
                    chunk_id: chunk.chunk_id.clone(),
                    file_path: chunk.file_path.clone(),
                })
                .collect(),
        );
        targets.insert(
            *index,
            WriteTarget {
                path: info.full_path.clone(),
                total: chunks.len() as u32,
                append: resume.is_clean_partial(*index),
            },
        );
    }

    let workers = opts.workers.max(1);
    let gate = Arc::new(MemoryGate::new(opts.max_memory, MAX_CHUNK));
    let (job_tx, job_rx) = async_channel::bounded::<ChunkJob>(workers * 2);
    let (result_tx, result_rx) = mpsc::channel::<ChunkResult>(workers * 2);

    debug!(
        "downloading {} files with {} workers, {} MiB budget",
        targets.len(),
        workers,
        gate_budget_mib(opts.max_memory)
    );

    let scheduler = tokio::spawn(schedule_jobs(queues, job_tx, cancel.clone()));

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        pool.spawn(worker_loop(
            job_rx.clone(),
            result_tx.clone(),
            fetcher.clone(),
            source.clone(),
            gate.clone(),
            progress.clone(),
            cancel.clone(),
            opts.skip_verify,
        ));
    }
    // The writer's channel closes once every worker has exited.
    drop(result_tx);
    drop(job_rx);

    let outcome = writer::run(result_rx, targets, &gate, &progress, &cancel).await;

    scheduler.await.expect("scheduler panicked");
    while pool.join_next().await.is_some() {}

    outcome
}

fn gate_budget_mib(max_memory: u64) -> u64 {
    max_memory.max(MAX_CHUNK) / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(file_index: u32, chunk_index: u32) -> ChunkJob {
        ChunkJob {
            file_index,
            chunk_index,
            chunk_id: format!("f{file_index}_{chunk_index}_ff"),
            file_path: format!("f{file_index}.bin"),
        }
    }

    #[tokio::test]
    async fn test_scheduler_interleaves_files_fairly() {
        let queues = vec![
            VecDeque::from([job(0, 0), job(0, 1), job(0, 2), job(0, 3)]),
            VecDeque::from([job(1, 0), job(1, 1)]),
            VecDeque::from([job(2, 0)]),
        ];
        let (tx, rx) = async_channel::bounded(16);
        schedule_jobs(queues, tx, CancellationToken::new()).await;

        let mut order = Vec::new();
        while let Ok(job) = rx.try_recv() {
            order.push((job.file_index, job.chunk_index));
        }
        assert_eq!(
            order,
            vec![
                // Pass 1: one chunk from every file.
                (0, 0),
                (1, 0),
                (2, 0),
                // Pass 2: file 2 is done.
                (0, 1),
                (1, 1),
                // Remaining passes: only file 0 left.
                (0, 2),
                (0, 3),
            ]
        );
    }

    #[tokio::test]
    async fn test_scheduler_sends_chunks_in_file_order() {
        let queues = vec![VecDeque::from([job(0, 0), job(0, 1), job(0, 2)])];
        let (tx, rx) = async_channel::bounded(16);
        schedule_jobs(queues, tx, CancellationToken::new()).await;

        let mut previous = None;
        while let Ok(job) = rx.try_recv() {
            if let Some(prev) = previous {
                assert_eq!(job.chunk_index, prev + 1);
            }
            previous = Some(job.chunk_index);
        }
        assert_eq!(previous, Some(2));
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let queues = vec![VecDeque::from([job(0, 0), job(0, 1)])];
        // Capacity 1 forces the scheduler to block on the second send.
        let (tx, rx) = async_channel::bounded(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(schedule_jobs(queues, tx, cancel.clone()));
        // Let the first send land, then cancel while it waits.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("scheduler must stop on cancel")
            .unwrap();

        assert_eq!(rx.len(), 1);
    }
}
