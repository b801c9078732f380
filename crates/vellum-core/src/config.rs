//! Store configuration.
//!
//! All tunables live in [`StoreConfig`]; zero or nonsense values are rejected
//! by `validate()` before the store opens. Defaults are chosen for a small
//! embedded deployment and can be overridden field-by-field.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Byte cap on stream, tenant, and command identifiers.
pub const MAX_ID_BYTES: usize = 255;

/// Configuration for the event log and its surrounding machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Roll the active segment once it exceeds this many bytes.
    pub segment_max_bytes: u64,
    /// Reject event payloads larger than this.
    pub max_payload_bytes: usize,
    /// Maximum events accepted in a single append call.
    pub max_batch_events: usize,
    /// Fsync the active segment on every commit group. Disabling this trades
    /// durability for throughput and is only safe for throwaway stores.
    pub fsync_on_commit: bool,
    /// Write an index snapshot after this many committed batches
    /// (0 disables snapshotting).
    pub index_snapshot_interval_batches: u64,
    /// Keep per-revision locator lists in memory for at most this many
    /// streams; colder streams are rebuilt from segments on demand.
    pub locator_cache_streams: usize,
    /// Admission controller tunables.
    pub admission: AdmissionConfig,
    /// Projection runtime tunables.
    pub projections: ProjectionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 128 * 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
            max_batch_events: 4096,
            fsync_on_commit: true,
            index_snapshot_interval_batches: 4096,
            locator_cache_streams: 16_384,
            admission: AdmissionConfig::default(),
            projections: ProjectionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Validate config for runtime safety.
    pub fn validate(&self) -> Result<()> {
        if self.segment_max_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "segment_max_bytes must be >= 1".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(StoreError::InvalidConfig(
                "max_payload_bytes must be >= 1".to_string(),
            ));
        }
        if self.max_batch_events == 0 {
            return Err(StoreError::InvalidConfig(
                "max_batch_events must be >= 1".to_string(),
            ));
        }
        if self.locator_cache_streams == 0 {
            return Err(StoreError::InvalidConfig(
                "locator_cache_streams must be >= 1".to_string(),
            ));
        }
        self.admission.validate()?;
        self.projections.validate()?;
        Ok(())
    }
}

/// Closed-loop admission controller tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Target p99 write latency the controller steers toward.
    pub target_p99_ms: f64,
    /// Hard upper bound on the in-flight write limit.
    pub hard_cap: usize,
    /// Initial in-flight write limit.
    pub initial_limit: usize,
    /// Latency samples retained for the p99 estimate.
    pub sample_window: usize,
    /// Periodic evaluation cadence.
    pub tick_interval_ms: u64,
    /// Also evaluate after every N-th completed write.
    pub evaluate_every: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            target_p99_ms: 25.0,
            hard_cap: 256,
            initial_limit: 32,
            sample_window: 1024,
            tick_interval_ms: 250,
            evaluate_every: 64,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_p99_ms > 0.0) {
            return Err(StoreError::InvalidConfig(
                "admission.target_p99_ms must be > 0".to_string(),
            ));
        }
        if self.hard_cap == 0 {
            return Err(StoreError::InvalidConfig(
                "admission.hard_cap must be >= 1".to_string(),
            ));
        }
        if self.initial_limit == 0 || self.initial_limit > self.hard_cap {
            return Err(StoreError::InvalidConfig(
                "admission.initial_limit must be in [1, hard_cap]".to_string(),
            ));
        }
        if self.sample_window == 0 {
            return Err(StoreError::InvalidConfig(
                "admission.sample_window must be >= 1".to_string(),
            ));
        }
        if self.evaluate_every == 0 {
            return Err(StoreError::InvalidConfig(
                "admission.evaluate_every must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Projection runtime defaults; each registration may override batch size
/// and poll interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Events fetched per batch when the registration does not say otherwise.
    pub batch_size: usize,
    /// Idle poll delay when the projection is caught up.
    pub poll_interval_ms: u64,
    /// Re-run every handler batch twice and diff the op lists; a mismatch
    /// fails the projection loudly. Intended for test environments.
    pub deterministic_replay_check: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 50,
            deterministic_replay_check: false,
        }
    }
}

impl ProjectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(StoreError::InvalidConfig(
                "projections.batch_size must be >= 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(StoreError::InvalidConfig(
                "projections.poll_interval_ms must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
