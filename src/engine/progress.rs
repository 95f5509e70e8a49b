//! Progress accounting for a download run
//!
//! Atomic counters for bytes and file completions, an EMA download rate,
//! and optionally a pair of indicatif bars (network rate on top, disk
//! progress below). Workers and the writer update the tracker from their
//! own tasks; rendering happens on indicatif's ticker.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Smoothing horizon for the download rate.
const EMA_TAU_SECS: f64 = 3.0;

struct SpeedEma {
    last: Instant,
    rate: f64,
}

impl SpeedEma {
    fn new() -> Self {
        Self {
            last: Instant::now(),
            rate: 0.0,
        }
    }

    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        self.last = now;
        let instant_rate = bytes as f64 / dt;
        let alpha = 1.0 - (-dt / EMA_TAU_SECS).exp();
        self.rate += alpha * (instant_rate - self.rate);
    }
}

struct Bars {
    _multi: MultiProgress,
    download: ProgressBar,
    disk: ProgressBar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_written: u64,
    pub files_completed: u32,
    pub total_bytes: u64,
    pub total_files: u32,
    /// EMA download speed in bytes per second.
    pub download_rate: f64,
}

pub struct ProgressTracker {
    total_bytes: u64,
    total_files: u32,
    bytes_downloaded: AtomicU64,
    bytes_written: AtomicU64,
    files_completed: AtomicU32,
    speed: Mutex<SpeedEma>,
    bars: Option<Bars>,
}

impl ProgressTracker {
    /// Counter-only tracker (tests, `--info`, quiet runs).
    pub fn new(total_bytes: u64, total_files: u32) -> Self {
        Self {
            total_bytes,
            total_files,
            bytes_downloaded: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            files_completed: AtomicU32::new(0),
            speed: Mutex::new(SpeedEma::new()),
            bars: None,
        }
    }

    /// Tracker with terminal bars: download rate above, disk progress
    /// with ETA below.
    pub fn with_bars(total_bytes: u64, total_files: u32) -> Self {
        let multi = MultiProgress::new();
        let download_style =
            ProgressStyle::with_template("{wide_msg} Download: {binary_bytes_per_sec}")
                .expect("static template");
        let disk_style = ProgressStyle::with_template(
            "{wide_msg} Disk: {binary_bytes_per_sec}\n[{percent}%] {wide_bar} {bytes:>10}/{total_bytes:10} [{eta_precise}]",
        )
        .expect("static template")
        .progress_chars("##-");

        let download = multi.add(ProgressBar::new(total_bytes).with_style(download_style));
        let disk = multi.insert_after(&download, ProgressBar::new(total_bytes).with_style(disk_style));

        let mut tracker = Self::new(total_bytes, total_files);
        tracker.bars = Some(Bars {
            _multi: multi,
            download,
            disk,
        });
        tracker
    }

    /// Credit work already on disk from a previous interrupted run.
    pub fn pre_credit(&self, bytes: u64, files: u32) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.files_completed.fetch_add(files, Ordering::Relaxed);
        if let Some(bars) = &self.bars {
            bars.download.inc(bytes);
            bars.disk.inc(bytes);
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.speed.lock().unwrap().record(bytes);
        if let Some(bars) = &self.bars {
            bars.download.inc(bytes);
        }
    }

    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if let Some(bars) = &self.bars {
            bars.disk.inc(bytes);
        }
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            total_files: self.total_files,
            download_rate: self.speed.lock().unwrap().rate,
        }
    }

    pub fn finish(&self) {
        if let Some(bars) = &self.bars {
            bars.download.finish_and_clear();
            bars.disk.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counters_accumulate() {
        let tracker = ProgressTracker::new(100, 2);
        tracker.add_downloaded(40);
        tracker.add_written(40);
        tracker.add_downloaded(60);
        tracker.add_written(60);
        tracker.file_completed();
        tracker.file_completed();

        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_downloaded, 100);
        assert_eq!(snap.bytes_written, 100);
        assert_eq!(snap.files_completed, 2);
        assert_eq!(snap.total_bytes, 100);
        assert_eq!(snap.total_files, 2);
    }

    #[test]
    fn test_pre_credit_counts_as_both() {
        let tracker = ProgressTracker::new(1000, 3);
        tracker.pre_credit(400, 1);
        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_downloaded, 400);
        assert_eq!(snap.bytes_written, 400);
        assert_eq!(snap.files_completed, 1);
    }

    #[test]
    fn test_ema_rate_rises_with_traffic() {
        let tracker = ProgressTracker::new(1 << 20, 1);
        std::thread::sleep(Duration::from_millis(10));
        tracker.add_downloaded(512 * 1024);
        std::thread::sleep(Duration::from_millis(10));
        tracker.add_downloaded(512 * 1024);
        assert!(tracker.snapshot().download_rate > 0.0);
    }
}
