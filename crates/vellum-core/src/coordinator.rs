//! Projection coordinator: one worker per registered projection.
//!
//! Each worker pulls batches from the reader in global order, stages handler
//! output per tenant, and commits ops plus checkpoint in one state-store
//! transaction. There is at most one in-flight batch per projection;
//! different projections progress independently.
//!
//! # Worker state machine
//!
//! ```text
//! Idle ──tick──► Fetching ──empty──► Idle (poll delay)
//!                   │ batch
//!                   ▼
//!               Applying ──handler error──► ErrorDecision (skip/retry/stop)
//!                   │ ok                         │ stop
//!                   ▼                            ▼
//!               Committing ──store error──► Failed (restart only)
//!                   │ ok
//!                   ▼
//!                 Idle
//! ```
//!
//! Aborting before commit is always safe: no progress is recorded, and the
//! batch is re-delivered on the next fetch.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProjectionConfig;
use crate::error::{Result, StoreError};
use crate::projection::{
    ErrorVerdict, ProjectionDef, ProjectionHandler, StagedView, TableOp,
};
use crate::projection_store::{ProjectionStateStore, ProjectionTable};
use crate::reader::LogReader;
use crate::record::EventRecord;

/// Lifecycle of one projection worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    /// Gracefully stopped; restart resumes from the checkpoint.
    Stopped,
    /// Terminal failure; the reason is carried alongside.
    Failed(String),
}

/// Per-projection progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionLag {
    pub projection: String,
    /// Highest applied global position (0 before the first commit).
    pub checkpoint: u64,
    pub global_head: u64,
    pub events_behind: u64,
    pub state: WorkerState,
}

/// A batch handed out by the manual pump: events after `from_checkpoint`
/// in global order.
#[derive(Debug, Clone)]
pub struct ProjectionBatch {
    pub projection: String,
    pub from_checkpoint: u64,
    pub events: Vec<EventRecord>,
}

/// Outcome of one worker step.
enum Progress {
    Applied,
    CaughtUp,
}

/// Why a worker step failed.
#[derive(Debug)]
enum RunError {
    Store(StoreError),
    HandlerStopped { global_pos: u64, message: String },
    NonDeterministic,
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "state store error: {err}"),
            Self::HandlerStopped {
                global_pos,
                message,
            } => write!(f, "handler stopped at position {global_pos}: {message}"),
            Self::NonDeterministic => write!(
                f,
                "handler produced different ops on replay; projection handlers must be deterministic"
            ),
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

struct WorkerHandle {
    def: ProjectionDef,
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    status: Arc<Mutex<WorkerState>>,
}

/// Owns every projection worker plus the manual-pump surface.
pub(crate) struct ProjectionRuntime {
    state_store: Arc<ProjectionStateStore>,
    reader: LogReader,
    cfg: ProjectionConfig,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl ProjectionRuntime {
    pub fn new(state_store: Arc<ProjectionStateStore>, reader: LogReader, cfg: ProjectionConfig) -> Self {
        Self {
            state_store,
            reader,
            cfg,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a projection and start its worker. Must be called within a
    /// Tokio runtime.
    pub fn register(&self, def: ProjectionDef) -> Result<()> {
        def.schema.validate()?;
        let table = self.state_store.register(&def.name, &def.schema)?;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.contains_key(&def.name) {
            return Err(StoreError::InvalidRequest(format!(
                "projection {} is already registered",
                def.name
            )));
        }
        let handle = self.spawn(def.clone(), table);
        workers.insert(def.name, handle);
        Ok(())
    }

    /// Bring a `Stopped` or `Failed` worker back up from its checkpoint.
    pub fn restart(&self, name: &str) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = workers.get_mut(name) else {
            return Err(StoreError::ProjectionNotFound {
                projection: name.to_string(),
            });
        };
        let state = handle
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if state == WorkerState::Running {
            return Err(StoreError::InvalidRequest(format!(
                "projection {name} is still running"
            )));
        }
        let table = self.state_store.require(name)?;
        let def = handle.def.clone();
        *handle = self.spawn(def, table);
        info!(projection = name, "projection worker restarted");
        Ok(())
    }

    /// Graceful stop: the worker finishes (or safely abandons) its current
    /// batch and exits without recording partial progress.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let (stop, join) = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(handle) = workers.get_mut(name) else {
                return Err(StoreError::ProjectionNotFound {
                    projection: name.to_string(),
                });
            };
            (handle.stop.clone(), handle.join.take())
        };
        let _ = stop.send(true);
        if let Some(join) = join {
            if let Err(err) = join.await {
                warn!(projection = name, error = %err, "worker join failed");
            }
        }
        Ok(())
    }

    /// Flip every worker's stop flag without waiting; used on drop, where
    /// awaiting joins is not possible.
    pub fn signal_stop_all(&self) {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in workers.values() {
            let _ = handle.stop.send(true);
        }
    }

    /// Stop every worker; used by `Store::close`.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.keys().cloned().collect()
        };
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    /// Progress snapshot for every registered projection, sorted by name.
    pub fn lag(&self) -> Result<Vec<ProjectionLag>> {
        let head = self.reader.head();
        let entries: Vec<(String, Arc<Mutex<WorkerState>>)> = {
            let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers
                .iter()
                .map(|(name, handle)| (name.clone(), Arc::clone(&handle.status)))
                .collect()
        };

        let mut out = Vec::with_capacity(entries.len());
        for (name, status) in entries {
            let checkpoint = self
                .state_store
                .require(&name)?
                .checkpoint()?
                .unwrap_or(0);
            out.push(ProjectionLag {
                projection: name,
                checkpoint,
                global_head: head,
                events_behind: head.saturating_sub(checkpoint),
                state: status.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            });
        }
        out.sort_by(|a, b| a.projection.cmp(&b.projection));
        Ok(out)
    }

    /// Manual pump, fetch half: the next batch of events past the
    /// checkpoint, or `None` when the projection is caught up.
    pub fn fetch_batch(&self, name: &str, batch_size: usize) -> Result<Option<ProjectionBatch>> {
        let table = self.state_store.require(name)?;
        let from_checkpoint = table.checkpoint()?.unwrap_or(0);
        let events = self.reader.read_global(from_checkpoint + 1, batch_size)?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProjectionBatch {
            projection: name.to_string(),
            from_checkpoint,
            events,
        }))
    }

    /// Manual pump, apply half: commit tenant-grouped ops and the
    /// checkpoint advance atomically.
    pub fn apply_ops(
        &self,
        name: &str,
        ops_by_tenant: &[(String, Vec<TableOp>)],
        last_global_pos: u64,
    ) -> Result<()> {
        self.state_store
            .require(name)?
            .apply_batch(ops_by_tenant, last_global_pos)
    }

    fn spawn(&self, def: ProjectionDef, table: Arc<ProjectionTable>) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(Mutex::new(WorkerState::Running));
        let ctx = WorkerCtx {
            name: def.name.clone(),
            handler: Arc::clone(&def.handler),
            table,
            reader: self.reader.clone(),
            batch_size: def.batch_size.unwrap_or(self.cfg.batch_size),
            poll_interval_ms: def.poll_interval_ms.unwrap_or(self.cfg.poll_interval_ms),
            replay_check: self.cfg.deterministic_replay_check,
            status: Arc::clone(&status),
        };
        let join = tokio::spawn(ctx.run(stop_rx));
        WorkerHandle {
            def,
            stop: stop_tx,
            join: Some(join),
            status,
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct WorkerCtx {
    name: String,
    handler: Arc<dyn ProjectionHandler>,
    table: Arc<ProjectionTable>,
    reader: LogReader,
    batch_size: usize,
    poll_interval_ms: u64,
    replay_check: bool,
    status: Arc<Mutex<WorkerState>>,
}

impl WorkerCtx {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!(projection = %self.name, "projection worker started");
        loop {
            if *stop_rx.borrow() {
                self.set_state(WorkerState::Stopped);
                info!(projection = %self.name, "projection worker stopped");
                return;
            }

            let step = {
                let name = self.name.clone();
                let handler = Arc::clone(&self.handler);
                let table = Arc::clone(&self.table);
                let reader = self.reader.clone();
                let batch_size = self.batch_size;
                let replay_check = self.replay_check;
                tokio::task::spawn_blocking(move || {
                    run_once(&name, handler.as_ref(), &table, &reader, batch_size, replay_check)
                })
                .await
            };

            match step {
                Ok(Ok(Progress::Applied)) => {
                    // Immediately try the next batch; yield to stay fair.
                    tokio::task::yield_now().await;
                }
                Ok(Ok(Progress::CaughtUp)) => {
                    let delay = jittered(self.poll_interval_ms);
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Err(err)) => {
                    error!(projection = %self.name, error = %err, "projection worker failed");
                    self.set_state(WorkerState::Failed(err.to_string()));
                    return;
                }
                Err(join_err) => {
                    error!(projection = %self.name, error = %join_err, "projection step panicked");
                    self.set_state(WorkerState::Failed(join_err.to_string()));
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Poll delay with ±20% jitter so many idle workers do not tick in lockstep.
fn jittered(poll_interval_ms: u64) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..1.2);
    Duration::from_millis(((poll_interval_ms as f64) * factor).max(1.0) as u64)
}

/// One Fetch → Apply → Commit cycle.
fn run_once(
    name: &str,
    handler: &dyn ProjectionHandler,
    table: &ProjectionTable,
    reader: &LogReader,
    batch_size: usize,
    replay_check: bool,
) -> std::result::Result<Progress, RunError> {
    let checkpoint = table.checkpoint()?.unwrap_or(0);
    let events = reader.read_global(checkpoint + 1, batch_size)?;
    let Some(last) = events.last() else {
        return Ok(Progress::CaughtUp);
    };
    // The watermark is the last *scanned* position: filtered and skipped
    // events advance the checkpoint too, or the worker would spin on them.
    let watermark = last.global_pos;

    let staged = stage_batch(handler, table, &events)?;
    if replay_check && staged.clean {
        let replay = stage_batch(handler, table, &events)?;
        if replay.ops_by_tenant != staged.ops_by_tenant {
            return Err(RunError::NonDeterministic);
        }
    }

    table.apply_batch(&staged.ops_by_tenant, watermark)?;
    debug!(
        projection = name,
        events = events.len(),
        watermark,
        "projection batch applied"
    );
    Ok(Progress::Applied)
}

#[derive(Debug)]
struct StagedBatch {
    /// Tenant-grouped ops in first-touch order; per-tenant op order is the
    /// handlers' emission order.
    ops_by_tenant: Vec<(String, Vec<TableOp>)>,
    /// False if any event needed the error policy; the replay check only
    /// runs on clean batches.
    clean: bool,
}

/// Deliver a batch to the handler against per-tenant staged views.
fn stage_batch(
    handler: &dyn ProjectionHandler,
    table: &ProjectionTable,
    events: &[EventRecord],
) -> std::result::Result<StagedBatch, RunError> {
    let mut order: Vec<String> = Vec::new();
    let mut views: HashMap<String, StagedView<'_>> = HashMap::new();
    let mut clean = true;

    for event in events {
        if !handler.applies_to(event) {
            continue;
        }
        let tenant = handler.tenant_id(event);
        let view = match views.entry(tenant.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                order.push(tenant.clone());
                entry.insert(StagedView::new(table, tenant))
            }
        };

        let snapshot = view.snapshot();
        if let Err(err) = handler.apply(event, view) {
            clean = false;
            match handler.on_error(&err, event) {
                ErrorVerdict::Skip => {
                    debug!(
                        global_pos = event.global_pos,
                        error = %err,
                        "event skipped by error policy"
                    );
                    view.restore(snapshot);
                }
                ErrorVerdict::Retry => {
                    // The staged view is re-seeded to the pre-event
                    // snapshot before the retry; a second failure is
                    // terminal.
                    view.restore(snapshot);
                    let retry_snapshot = view.snapshot();
                    if let Err(err) = handler.apply(event, view) {
                        view.restore(retry_snapshot);
                        return Err(RunError::HandlerStopped {
                            global_pos: event.global_pos,
                            message: err.to_string(),
                        });
                    }
                }
                ErrorVerdict::Stop => {
                    return Err(RunError::HandlerStopped {
                        global_pos: event.global_pos,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    let mut ops_by_tenant = Vec::with_capacity(order.len());
    for tenant in order {
        if let Some(view) = views.remove(&tenant) {
            let ops = view.into_ops();
            if !ops.is_empty() {
                ops_by_tenant.push((tenant, ops));
            }
        }
    }
    Ok(StagedBatch {
        ops_by_tenant,
        clean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{ColumnType, ProjectionError, Row, TableSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        TableSchema::new(
            [("id", ColumnType::Text), ("n", ColumnType::Integer)],
            "id",
        )
    }

    fn table(dir: &std::path::Path) -> Arc<ProjectionTable> {
        let store = ProjectionStateStore::open(dir).unwrap();
        store.register("counts", &schema()).unwrap()
    }

    fn event(pos: u64, tenant: &str, payload: &str) -> EventRecord {
        EventRecord {
            global_pos: pos,
            stream_id: "s".to_string(),
            stream_rev: pos,
            tenant_id: tenant.to_string(),
            command_id: format!("c-{pos}"),
            timestamp_ms: 1,
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn count_row(id: &str, n: i64) -> Row {
        Row::from([
            ("id".to_string(), json!(id)),
            ("n".to_string(), json!(n)),
        ])
    }

    /// Counts events per tenant under key "x".
    struct Counter;

    impl ProjectionHandler for Counter {
        fn apply(
            &self,
            _event: &EventRecord,
            table: &mut StagedView<'_>,
        ) -> std::result::Result<(), ProjectionError> {
            let n = table
                .get("x")?
                .and_then(|row| row.get("n").and_then(serde_json::Value::as_i64))
                .unwrap_or(0);
            table.set("x", count_row("x", n + 1));
            Ok(())
        }
    }

    /// Fails on events whose payload is "poison"; verdict configurable.
    struct Poisoned {
        verdict: ErrorVerdict,
        attempts: AtomicUsize,
        fail_retry_too: bool,
    }

    impl ProjectionHandler for Poisoned {
        fn apply(
            &self,
            event: &EventRecord,
            table: &mut StagedView<'_>,
        ) -> std::result::Result<(), ProjectionError> {
            if event.payload == b"poison" {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if self.fail_retry_too || attempt == 0 {
                    // Stage something first so rollback is observable.
                    table.set("junk", count_row("junk", -1));
                    return Err(ProjectionError::handler("poison event"));
                }
            }
            let n = table
                .get("x")?
                .and_then(|row| row.get("n").and_then(serde_json::Value::as_i64))
                .unwrap_or(0);
            table.set("x", count_row("x", n + 1));
            Ok(())
        }

        fn on_error(&self, _err: &ProjectionError, _event: &EventRecord) -> ErrorVerdict {
            self.verdict
        }
    }

    // ---- Staging ----

    #[test]
    fn staged_batch_counts_in_order() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let events: Vec<EventRecord> = (1..=5).map(|i| event(i, "t", "inc")).collect();

        let staged = stage_batch(&Counter, &table, &events).unwrap();
        assert!(staged.clean);
        assert_eq!(staged.ops_by_tenant.len(), 1);
        let (tenant, ops) = &staged.ops_by_tenant[0];
        assert_eq!(tenant, "t");
        assert_eq!(ops.len(), 5);
        // The last op reflects all five increments via the staged reads.
        assert_eq!(
            ops[4],
            TableOp::Upsert {
                key: "x".to_string(),
                row: count_row("x", 5)
            }
        );
    }

    #[test]
    fn tenants_get_independent_views() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let events = vec![
            event(1, "t1", "inc"),
            event(2, "t2", "inc"),
            event(3, "t1", "inc"),
        ];

        let staged = stage_batch(&Counter, &table, &events).unwrap();
        assert_eq!(staged.ops_by_tenant.len(), 2);
        // First-touch order: t1 before t2.
        assert_eq!(staged.ops_by_tenant[0].0, "t1");
        assert_eq!(staged.ops_by_tenant[1].0, "t2");
        // t1 saw two increments, t2 one.
        assert_eq!(staged.ops_by_tenant[0].1.len(), 2);
        assert_eq!(staged.ops_by_tenant[1].1.len(), 1);
        assert_eq!(
            staged.ops_by_tenant[0].1[1],
            TableOp::Upsert {
                key: "x".to_string(),
                row: count_row("x", 2)
            }
        );
    }

    // ---- Error policy ----

    #[test]
    fn skip_discards_partial_ops_and_continues() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let handler = Poisoned {
            verdict: ErrorVerdict::Skip,
            attempts: AtomicUsize::new(0),
            fail_retry_too: true,
        };
        let events = vec![
            event(1, "t", "inc"),
            event(2, "t", "poison"),
            event(3, "t", "inc"),
        ];

        let staged = stage_batch(&handler, &table, &events).unwrap();
        assert!(!staged.clean);
        let (_, ops) = &staged.ops_by_tenant[0];
        // The poison event's junk op was rolled back; two increments made it.
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| !matches!(
            op,
            TableOp::Upsert { key, .. } if key == "junk"
        )));
        assert_eq!(
            ops[1],
            TableOp::Upsert {
                key: "x".to_string(),
                row: count_row("x", 2)
            }
        );
    }

    #[test]
    fn retry_reseeds_the_view_and_succeeds_once() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let handler = Poisoned {
            verdict: ErrorVerdict::Retry,
            attempts: AtomicUsize::new(0),
            fail_retry_too: false,
        };
        let events = vec![
            event(1, "t", "inc"),
            event(2, "t", "poison"),
            event(3, "t", "inc"),
        ];

        let staged = stage_batch(&handler, &table, &events).unwrap();
        let (_, ops) = &staged.ops_by_tenant[0];
        // Retry succeeded: three increments, no junk from the failed pass.
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[2],
            TableOp::Upsert {
                key: "x".to_string(),
                row: count_row("x", 3)
            }
        );
    }

    #[test]
    fn second_retry_failure_escalates_to_stop() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let handler = Poisoned {
            verdict: ErrorVerdict::Retry,
            attempts: AtomicUsize::new(0),
            fail_retry_too: true,
        };
        let events = vec![event(1, "t", "poison")];

        let err = stage_batch(&handler, &table, &events).unwrap_err();
        assert!(matches!(
            err,
            RunError::HandlerStopped { global_pos: 1, .. }
        ));
    }

    #[test]
    fn stop_verdict_is_terminal() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let handler = Poisoned {
            verdict: ErrorVerdict::Stop,
            attempts: AtomicUsize::new(0),
            fail_retry_too: true,
        };
        let events = vec![event(1, "t", "inc"), event(2, "t", "poison")];
        assert!(stage_batch(&handler, &table, &events).is_err());
    }

    // ---- Filtered events ----

    struct OnlyInc;

    impl ProjectionHandler for OnlyInc {
        fn apply(
            &self,
            _event: &EventRecord,
            table: &mut StagedView<'_>,
        ) -> std::result::Result<(), ProjectionError> {
            let n = table
                .get("x")?
                .and_then(|row| row.get("n").and_then(serde_json::Value::as_i64))
                .unwrap_or(0);
            table.set("x", count_row("x", n + 1));
            Ok(())
        }

        fn applies_to(&self, event: &EventRecord) -> bool {
            event.payload == b"inc"
        }
    }

    #[test]
    fn filtered_events_leave_no_ops() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        let events = vec![
            event(1, "t", "noise"),
            event(2, "t", "inc"),
            event(3, "t", "noise"),
        ];
        let staged = stage_batch(&OnlyInc, &table, &events).unwrap();
        assert_eq!(staged.ops_by_tenant.len(), 1);
        assert_eq!(staged.ops_by_tenant[0].1.len(), 1);

        let all_noise = vec![event(4, "t", "noise")];
        let staged = stage_batch(&OnlyInc, &table, &all_noise).unwrap();
        assert!(staged.ops_by_tenant.is_empty());
    }
}
