//! Adaptive write admission.
//!
//! A closed-loop controller keeps the number of in-flight writes at a level
//! compatible with a target p99 commit latency:
//!
//! ```text
//! completion latencies ──► ring window ──► approximate p99
//!                                              │
//!        p99 > 1.1 × target, rejections < 20%  ├──► limit − 1  (floor 1)
//!        p99 < 0.7 × target, in-flight ≥ 90%   ├──► limit + 1  (cap hard_cap)
//!        otherwise                             └──► hold
//! ```
//!
//! A write that would exceed the limit is rejected with `Overloaded`
//! immediately — never queued, never delayed. The controller is evaluated
//! on a periodic tick and after every N-th completion.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::error::{Result, StoreError};

/// Observability snapshot of the admission controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub current_limit: usize,
    pub observed_p99_ms: f64,
    pub target_p99_ms: f64,
    pub requests_accepted: u64,
    pub requests_rejected: u64,
    /// Rejected fraction of all requests seen so far.
    pub rejection_rate: f64,
    /// Limit changes made since open.
    pub adjustments: u64,
}

/// Fixed-capacity ring of recent completion latencies. When full, new
/// samples overwrite the oldest.
#[derive(Debug)]
struct LatencyWindow {
    buf: Vec<f64>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, sample_ms: f64) {
        self.buf[self.head] = sample_ms;
        self.head = (self.head + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    /// Approximate p99 over the window; `None` until a sample lands.
    fn p99(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let mut sorted: Vec<f64> = self.buf[..self.len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((self.len as f64 * 0.99).ceil() as usize).clamp(1, self.len);
        Some(sorted[rank - 1])
    }
}

/// Counters snapshotted at the previous evaluation, for windowed rates.
#[derive(Debug, Default, Clone, Copy)]
struct EvalBaseline {
    accepted: u64,
    rejected: u64,
}

/// Closed-loop admission controller for the write path.
#[derive(Debug)]
pub(crate) struct AdmissionController {
    cfg: AdmissionConfig,
    limit: AtomicUsize,
    in_flight: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    adjustments: AtomicU64,
    completions: AtomicU64,
    /// f64 bits of the last computed p99.
    observed_p99_bits: AtomicU64,
    window: Mutex<LatencyWindow>,
    baseline: Mutex<EvalBaseline>,
}

impl AdmissionController {
    pub fn new(cfg: AdmissionConfig) -> Self {
        let window = LatencyWindow::new(cfg.sample_window);
        Self {
            limit: AtomicUsize::new(cfg.initial_limit),
            in_flight: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            adjustments: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            observed_p99_bits: AtomicU64::new(0.0f64.to_bits()),
            window: Mutex::new(window),
            baseline: Mutex::new(EvalBaseline::default()),
            cfg,
        }
    }

    /// Admit one write or reject with `Overloaded`. The returned guard must
    /// live for the duration of the write.
    pub fn try_acquire(&self) -> Result<InFlightGuard<'_>> {
        let limit = self.limit.load(Ordering::Acquire);
        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < limit { Some(current + 1) } else { None }
            })
            .is_ok();
        if admitted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            Ok(InFlightGuard { controller: self })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(StoreError::Overloaded { limit })
        }
    }

    /// Record a completed write's latency; every N-th completion also
    /// evaluates the control loop.
    pub fn on_complete(&self, latency_ms: f64) {
        {
            let mut window = self
                .window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            window.push(latency_ms);
        }
        let n = self.completions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.cfg.evaluate_every == 0 {
            self.evaluate();
        }
    }

    /// One control-loop step. Also driven by the store's periodic tick.
    pub fn evaluate(&self) {
        let p99 = {
            let window = self
                .window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            window.p99()
        };
        let Some(p99) = p99 else { return };
        self.observed_p99_bits.store(p99.to_bits(), Ordering::Relaxed);

        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let window_rate = {
            let mut baseline = self
                .baseline
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let da = accepted.saturating_sub(baseline.accepted);
            let dr = rejected.saturating_sub(baseline.rejected);
            *baseline = EvalBaseline { accepted, rejected };
            if da + dr == 0 {
                0.0
            } else {
                dr as f64 / (da + dr) as f64
            }
        };

        let limit = self.limit.load(Ordering::Acquire);
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let target = self.cfg.target_p99_ms;

        let new_limit = if p99 > target * 1.1 && window_rate < 0.2 {
            limit.saturating_sub(1).max(1)
        } else if p99 < target * 0.7 && in_flight as f64 >= limit as f64 * 0.9 {
            (limit + 1).min(self.cfg.hard_cap)
        } else {
            limit
        };

        if new_limit != limit {
            self.limit.store(new_limit, Ordering::Release);
            self.adjustments.fetch_add(1, Ordering::Relaxed);
            debug!(
                p99_ms = p99,
                target_ms = target,
                old_limit = limit,
                new_limit,
                "admission limit adjusted"
            );
        }
    }

    pub fn metrics(&self) -> AdmissionMetrics {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let total = accepted + rejected;
        AdmissionMetrics {
            current_limit: self.limit.load(Ordering::Acquire),
            observed_p99_ms: f64::from_bits(self.observed_p99_bits.load(Ordering::Relaxed)),
            target_p99_ms: self.cfg.target_p99_ms,
            requests_accepted: accepted,
            requests_rejected: rejected,
            rejection_rate: if total == 0 {
                0.0
            } else {
                rejected as f64 / total as f64
            },
            adjustments: self.adjustments.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn current_limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }
}

/// RAII guard for one admitted in-flight write.
#[derive(Debug)]
pub(crate) struct InFlightGuard<'a> {
    controller: &'a AdmissionController,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
