//! Running counters for requests, batches, and completions.
//!
//! Writers touch atomics only; `snapshot` derives the averages. The histogram
//! has one bin per legal batch size so `/stats` can show the distribution.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::task::ResponseSource;

pub struct StatsCollector {
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    batched_requests: AtomicU64,
    largest_batch: AtomicU64,
    mock_responses: AtomicU64,
    real_responses: AtomicU64,
    fallback_responses: AtomicU64,
    /// `histogram[size - 1]` counts completed batches of that size.
    histogram: Vec<AtomicU64>,
}

/// Read-only view served on `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_batches: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub batched_requests: u64,
    pub average_batch_size: f64,
    pub largest_batch: u64,
    pub mock_responses: u64,
    pub real_responses: u64,
    pub fallback_responses: u64,
    pub batch_size_histogram: Vec<u64>,
}

impl StatsCollector {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            batched_requests: AtomicU64::new(0),
            largest_batch: AtomicU64::new(0),
            mock_responses: AtomicU64::new(0),
            real_responses: AtomicU64::new(0),
            fallback_responses: AtomicU64::new(0),
            histogram: (0..max_batch_size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// One accepted submission.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// One batch fully dispatched and settled.
    pub fn record_batch(&self, size: usize) {
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.batched_requests.fetch_add(size as u64, Ordering::Relaxed);
        self.largest_batch.fetch_max(size as u64, Ordering::Relaxed);
        if let Some(bin) = self.histogram.get(size.saturating_sub(1)) {
            bin.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_completion(&self, source: ResponseSource) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        match source {
            ResponseSource::Real => &self.real_responses,
            ResponseSource::Mock => &self.mock_responses,
            ResponseSource::MockFallback => &self.fallback_responses,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_batches = self.total_batches.load(Ordering::Relaxed);
        let batched_requests = self.batched_requests.load(Ordering::Relaxed);
        let average_batch_size =
            if total_batches > 0 { batched_requests as f64 / total_batches as f64 } else { 0.0 };

        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_batches,
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            batched_requests,
            average_batch_size,
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
            mock_responses: self.mock_responses.load(Ordering::Relaxed),
            real_responses: self.real_responses.load(Ordering::Relaxed),
            fallback_responses: self.fallback_responses.load(Ordering::Relaxed),
            batch_size_histogram: self.histogram.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        }
    }
}
