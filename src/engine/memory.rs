//! Byte-counted memory admission gate
//!
//! Bounds the total chunk bytes buffered across the whole worker pool.
//! Workers reserve a flat [`MAX_CHUNK`](crate::manifest::MAX_CHUNK) per
//! chunk before fetching; the writer releases after flushing to disk.
//! Wakeups are broadcast, so admission order is whoever rechecks first —
//! fairness across files comes from the scheduler, not the gate.

use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct MemoryGate {
    max: u64,
    in_flight: Mutex<u64>,
    freed: Notify,
}

impl MemoryGate {
    /// A gate admitting up to `max_memory` bytes. The ceiling is raised to
    /// `min_reservation` so a single reservation can always pass.
    pub fn new(max_memory: u64, min_reservation: u64) -> Self {
        Self {
            max: max_memory.max(min_reservation),
            in_flight: Mutex::new(0),
            freed: Notify::new(),
        }
    }

    /// Block until `n` bytes fit under the ceiling, then reserve them.
    /// Returns false without reserving when the run is cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken, n: u64) -> bool {
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a release between
            // the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if *in_flight + n <= self.max {
                    *in_flight += n;
                    return true;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Return `n` bytes and wake every waiter.
    pub fn release(&self, n: u64) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight = in_flight.saturating_sub(n);
        }
        self.freed.notify_waiters();
    }

    /// Bytes currently reserved.
    pub fn in_flight(&self) -> u64 {
        *self.in_flight.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_within_bound() {
        let gate = MemoryGate::new(100, 1);
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel, 60).await);
        assert!(gate.acquire(&cancel, 40).await);
        assert_eq!(gate.in_flight(), 100);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let gate = Arc::new(MemoryGate::new(100, 1));
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel, 100).await);

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel, 50).await })
        };

        // Waiter cannot proceed while the gate is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.release(60);
        assert!(waiter.await.unwrap());
        assert_eq!(gate.in_flight(), 90);
    }

    #[tokio::test]
    async fn test_cancel_during_wait_returns_promptly() {
        let gate = Arc::new(MemoryGate::new(10, 1));
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel, 10).await);

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel, 10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let admitted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled acquire must return promptly")
            .unwrap();
        assert!(!admitted);
        // No lingering reservation from the refused acquire.
        assert_eq!(gate.in_flight(), 10);
    }

    #[tokio::test]
    async fn test_ceiling_raised_to_min_reservation() {
        let gate = MemoryGate::new(1, 1024);
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel, 1024).await);
    }

    #[tokio::test]
    async fn test_release_wakes_all_waiters() {
        let gate = Arc::new(MemoryGate::new(100, 1));
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel, 100).await);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { gate.acquire(&cancel, 25).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.release(100);

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(gate.in_flight(), 100);
    }
}
