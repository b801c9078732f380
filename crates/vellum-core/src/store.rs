//! The store facade: everything hangs off one [`Store`] value.
//!
//! `Store::open` runs segment recovery, starts the writer task and the
//! admission tick, and owns every background worker; `Store::close` tears
//! them down in order (projections, tick, writer). There is no process-wide
//! mutable state anywhere in the crate.
//!
//! Write path: caller → admission controller → writer task → fsync →
//! index update → readers see it → projection workers pull → handlers
//! transform → state store applies ops + checkpoint atomically.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::admission::{AdmissionController, AdmissionMetrics};
use crate::config::StoreConfig;
use crate::coordinator::{ProjectionBatch, ProjectionLag, ProjectionRuntime};
use crate::error::{Result, StoreError};
use crate::log::{AppendCommand, AppendReceipt, EventLog, ExpectedRevision, WriterStats};
use crate::projection::{ProjectionDef, Row, TableOp};
use crate::projection_store::ProjectionStateStore;
use crate::reader::LogReader;
use crate::record::EventRecord;

/// Liveness and shape snapshot of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    /// False once the commit path has quiesced; reopen to recover.
    pub healthy: bool,
    pub global_head: u64,
    pub stream_count: usize,
    pub segment_count: usize,
    pub last_error: Option<String>,
}

/// An embedded, append-only event store with tenant-scoped projections.
pub struct Store {
    root: PathBuf,
    log: Option<EventLog>,
    reader: LogReader,
    admission: Arc<AdmissionController>,
    state_store: Arc<ProjectionStateStore>,
    projections: ProjectionRuntime,
    admission_tick: Option<JoinHandle<()>>,
}

impl Store {
    /// Open (or create) a store at `root` with default configuration.
    /// Must be called within a Tokio runtime.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(root, StoreConfig::default())
    }

    /// Open (or create) a store at `root`. Recovery runs before this
    /// returns: torn tails are truncated and the index is rebuilt, so every
    /// previously acknowledged write is visible.
    pub fn open_with_config(root: impl AsRef<Path>, cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let log = EventLog::open(&root, cfg.clone())?;
        let reader = LogReader::new(log.shared());
        let state_store = Arc::new(ProjectionStateStore::open(&root)?);
        let projections = ProjectionRuntime::new(
            Arc::clone(&state_store),
            reader.clone(),
            cfg.projections.clone(),
        );

        let admission = Arc::new(AdmissionController::new(cfg.admission.clone()));
        let tick = {
            let controller = Arc::clone(&admission);
            let interval = Duration::from_millis(cfg.admission.tick_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    controller.evaluate();
                }
            })
        };

        info!(root = %root.display(), "store open");
        Ok(Self {
            root,
            log: Some(log),
            reader,
            admission,
            state_store,
            projections,
            admission_tick: Some(tick),
        })
    }

    /// Root directory this store lives under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---- Write path ----

    /// Append events to one stream under an optimistic revision check.
    /// Durable and visible once this returns.
    pub async fn append(
        &self,
        stream_id: &str,
        command_id: &str,
        expected: ExpectedRevision,
        payloads: Vec<Vec<u8>>,
        tenant_id: &str,
    ) -> Result<AppendReceipt> {
        let mut receipts = self
            .append_batch(
                vec![AppendCommand {
                    stream_id: stream_id.to_string(),
                    command_id: command_id.to_string(),
                    expected,
                    payloads,
                }],
                tenant_id,
            )
            .await?;
        Ok(receipts.remove(0))
    }

    /// Append to multiple streams atomically. All commands commit under one
    /// fsync or none do.
    pub async fn append_batch(
        &self,
        commands: Vec<AppendCommand>,
        tenant_id: &str,
    ) -> Result<Vec<AppendReceipt>> {
        let permit = self.admission.try_acquire()?;
        let start = Instant::now();
        let result = self.log()?.append_batch(commands, tenant_id).await;
        self.admission
            .on_complete(start.elapsed().as_secs_f64() * 1000.0);
        drop(permit);
        result
    }

    // ---- Read path (caller threads) ----

    /// Events of one stream in revision order; tenant-checked.
    pub fn read_stream(
        &self,
        stream_id: &str,
        from_rev: u64,
        max_count: usize,
        tenant_id: &str,
    ) -> Result<Vec<EventRecord>> {
        self.reader
            .read_stream(stream_id, from_rev, max_count, tenant_id)
    }

    /// Events in global order; trusted callers only (no tenant filter).
    pub fn read_global(&self, from_pos: u64, max_count: usize) -> Result<Vec<EventRecord>> {
        self.reader.read_global(from_pos, max_count)
    }

    /// Current revision of a stream; tenant-checked.
    pub fn get_stream_revision(&self, stream_id: &str, tenant_id: &str) -> Result<u64> {
        self.reader.get_stream_revision(stream_id, tenant_id)
    }

    /// Highest published global position (0 = empty).
    pub fn global_head(&self) -> u64 {
        self.reader.head()
    }

    // ---- Projections ----

    /// Register a projection and start its worker.
    pub fn register_projection(&self, def: ProjectionDef) -> Result<()> {
        self.projections.register(def)
    }

    /// Gracefully stop one projection worker.
    pub async fn stop_projection(&self, name: &str) -> Result<()> {
        self.projections.stop(name).await
    }

    /// Restart a stopped or failed projection worker from its checkpoint.
    pub fn restart_projection(&self, name: &str) -> Result<()> {
        self.projections.restart(name)
    }

    /// Highest global position applied to a projection, `None` before its
    /// first commit.
    pub fn get_projection_checkpoint(&self, name: &str) -> Result<Option<u64>> {
        self.state_store.require(name)?.checkpoint()
    }

    /// Read one materialized row under a tenant scope.
    pub fn read_projection_row(
        &self,
        name: &str,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Row>> {
        self.state_store.require(name)?.read_row(tenant_id, key)
    }

    /// Erase every row a tenant owns in one projection. Out of band with
    /// the log; meant for data-subject-erasure requests.
    pub fn delete_tenant_from_projection(&self, name: &str, tenant_id: &str) -> Result<usize> {
        self.state_store.require(name)?.delete_tenant(tenant_id)
    }

    /// Manual pump: the next batch of events past the projection's
    /// checkpoint, or `None` when caught up. The workers use the same path;
    /// this surface exists for embedders that drive projections themselves.
    pub fn get_projection_events(
        &self,
        name: &str,
        batch_size: usize,
    ) -> Result<Option<ProjectionBatch>> {
        self.projections.fetch_batch(name, batch_size)
    }

    /// Manual pump: atomically apply tenant-grouped ops and advance the
    /// projection checkpoint.
    pub fn apply_projection_batch(
        &self,
        name: &str,
        ops_by_tenant: &[(String, Vec<TableOp>)],
        last_global_pos: u64,
    ) -> Result<()> {
        self.projections.apply_ops(name, ops_by_tenant, last_global_pos)
    }

    /// Per-projection progress, sorted by name.
    pub fn projection_lag(&self) -> Result<Vec<ProjectionLag>> {
        self.projections.lag()
    }

    // ---- Observability ----

    /// Admission controller snapshot.
    pub fn get_admission_metrics(&self) -> AdmissionMetrics {
        self.admission.metrics()
    }

    /// Group-commit counters.
    pub fn writer_stats(&self) -> Result<WriterStats> {
        Ok(self.log()?.shared().stats())
    }

    /// Liveness and shape snapshot.
    pub fn health(&self) -> Result<StoreHealth> {
        let shared = self.log()?.shared();
        let stream_count = shared
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stream_count();
        let segment_count = shared
            .segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len();
        Ok(StoreHealth {
            healthy: shared.is_healthy(),
            global_head: shared.head(),
            stream_count,
            segment_count,
            last_error: shared.unhealthy_reason(),
        })
    }

    // ---- Lifecycle ----

    /// Stop projection workers, the admission tick, and the writer (which
    /// flushes durably and writes a final index snapshot).
    pub async fn close(mut self) {
        self.projections.stop_all().await;
        if let Some(tick) = self.admission_tick.take() {
            tick.abort();
        }
        if let Some(log) = self.log.take() {
            log.close().await;
        }
        info!(root = %self.root.display(), "store closed");
    }

    fn log(&self) -> Result<&EventLog> {
        self.log.as_ref().ok_or_else(|| StoreError::StoreUnhealthy {
            reason: "store is closed".to_string(),
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Dropping without close(): stop background tasks; the writer task
        // exits on its own once the channel closes with the log.
        if let Some(tick) = self.admission_tick.take() {
            tick.abort();
        }
        self.projections.signal_stop_all();
    }
}
