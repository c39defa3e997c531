use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Multi-producer staging queue drained in fixed-size batches.
///
/// Pollers push normalized lines from any task; one consumer takes at most
/// `batch_size` lines per drain tick so buffer mutation, persistence and
/// notification happen once per batch instead of once per line.
///
/// Taking a batch and handing it on happen under one lock, so batches reach
/// consumers in queue order even when a flush races the drain task.
#[derive(Debug)]
pub struct RateLimitedQueue<T = String> {
    pending: Mutex<VecDeque<T>>,
    consuming: Mutex<()>,
    batch_size: usize,
}

impl<T> RateLimitedQueue<T> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            consuming: Mutex::new(()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn push(&self, item: T) {
        self.pending.lock().push_back(item);
    }

    /// Enqueue items in order
    pub fn extend<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.pending.lock().extend(items);
    }

    /// Remove up to one batch from the front
    pub fn take_batch(&self) -> Vec<T> {
        let mut pending = self.pending.lock();
        let n = pending.len().min(self.batch_size);
        pending.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop everything not yet drained. Waits for a batch being handed on.
    pub fn clear(&self) {
        let _consuming = self.consuming.lock();
        self.pending.lock().clear();
    }

    /// Hand every queued item to `on_batch` right away, one batch at a time
    pub fn flush<F>(&self, mut on_batch: F)
    where
        F: FnMut(Vec<T>),
    {
        while self.consume_one(&mut on_batch) {}
    }

    fn consume_one<F>(&self, on_batch: &mut F) -> bool
    where
        F: FnMut(Vec<T>),
    {
        let _consuming = self.consuming.lock();
        let batch = self.take_batch();
        if batch.is_empty() {
            return false;
        }
        on_batch(batch);
        true
    }

    /// Drain one batch per `interval` into `on_batch` until cancelled, then
    /// flush whatever is left.
    pub async fn drain<F>(&self, interval: Duration, cancel: &CancellationToken, mut on_batch: F)
    where
        F: FnMut(Vec<T>),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.consume_one(&mut on_batch);
                }
            }
        }

        self.flush(on_batch);
    }
}
