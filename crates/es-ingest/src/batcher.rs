//! Batching for the bulk ingest channel

use std::time::{Duration, Instant};

/// Document batcher with size and time triggers
///
/// Owned by a single worker task, so no locking is needed.
pub struct Batcher<D> {
    batch: Vec<D>,
    max_size: usize,
    timeout: Duration,
    first_add: Option<Instant>,
}

impl<D> Batcher<D> {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            batch: Vec::with_capacity(max_size),
            max_size,
            timeout,
            first_add: None,
        }
    }

    pub fn add(&mut self, item: D) {
        if self.batch.is_empty() {
            self.first_add = Some(Instant::now());
        }
        self.batch.push(item);
    }

    pub fn is_full(&self) -> bool {
        self.batch.len() >= self.max_size
    }

    pub fn should_flush(&self) -> bool {
        self.is_full() || self.first_add.is_some_and(|t| t.elapsed() >= self.timeout)
    }

    /// Time left before the oldest buffered item is due
    pub fn time_until_due(&self) -> Duration {
        match self.first_add {
            Some(t) => self.timeout.saturating_sub(t.elapsed()),
            None => self.timeout,
        }
    }

    pub fn drain(&mut self) -> Vec<D> {
        self.first_add = None;
        std::mem::replace(&mut self.batch, Vec::with_capacity(self.max_size))
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}
