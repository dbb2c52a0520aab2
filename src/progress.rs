// src/progress.rs

//! Progress reporting
//!
//! Backends report package-local progress through a [`ProgressSink`]. The
//! apply engine wraps each sink so package progress is folded into an
//! overall percentage, weighting each package by its cost against the total
//! cost of the plan ([`WeightedProgress`]).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Receiver for package-local progress
///
/// Implementations must be thread-safe; cache-stage workers report
/// concurrently.
pub trait ProgressSink: Send + Sync {
    /// Report package progress in percent (0..=100)
    ///
    /// Returns `false` when the receiver asked to stop. Work in flight is
    /// never interrupted; the request is honoured at the next safe point.
    fn report(&self, percent: u8) -> bool;
}

/// Sink that ignores every report
#[derive(Debug, Default)]
pub struct SilentProgress {
    last: AtomicU64,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent percentage reported
    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Relaxed) as u8
    }
}

impl ProgressSink for SilentProgress {
    fn report(&self, percent: u8) -> bool {
        self.last.store(u64::from(percent.min(100)), Ordering::Relaxed);
        true
    }
}

/// Sink backed by a closure
pub struct CallbackProgress<F>
where
    F: Fn(u8) -> bool + Send + Sync,
{
    callback: F,
    stopped: AtomicBool,
}

impl<F> CallbackProgress<F>
where
    F: Fn(u8) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether any report was answered with a stop request
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl<F> ProgressSink for CallbackProgress<F>
where
    F: Fn(u8) -> bool + Send + Sync,
{
    fn report(&self, percent: u8) -> bool {
        let keep_going = (self.callback)(percent.min(100));
        if !keep_going {
            self.stopped.store(true, Ordering::Relaxed);
        }
        keep_going
    }
}

/// Folds weighted per-package progress into an overall percentage
#[derive(Debug)]
pub struct WeightedProgress {
    total: u64,
    completed: AtomicU64,
}

impl WeightedProgress {
    /// Create for a plan whose packages weigh `total` in sum
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
        }
    }

    /// Overall percentage while a package of `weight` is `percent` done
    pub fn overall(&self, weight: u64, percent: u8) -> u8 {
        let done = self.completed.load(Ordering::Relaxed).saturating_mul(100);
        let partial = weight.saturating_mul(u64::from(percent.min(100)));
        self.percent_of(done.saturating_add(partial))
    }

    /// Mark a package of `weight` finished; returns the new overall percentage
    pub fn complete(&self, weight: u64) -> u8 {
        let done = self.completed.fetch_add(weight, Ordering::Relaxed) + weight;
        self.percent_of(done.saturating_mul(100))
    }

    pub fn completed_weight(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// `scaled` is weight multiplied by percent
    fn percent_of(&self, scaled: u64) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (scaled.min(self.total.saturating_mul(100)) / self.total) as u8
    }
}
