//! The durable event log writer.
//!
//! A single writer task owns the active segment. Concurrent append calls
//! send commit requests over a channel and await their receipts; requests
//! that arrive while an fsync is in flight are drained together and
//! committed under one fsync (group commit). Each caller's batch remains its
//! own all-or-nothing recovery unit, and a caller's completion resolves
//! strictly after the fsync covering its batch.
//!
//! # Commit discipline
//!
//! ```text
//! check command-id ledger ──► validate revisions ──► assign positions ──►
//! serialize records + batch trailer ──► write ──► fsync ──►
//! update stream index ──► publish global head ──► reply
//! ```
//!
//! The fsync-before-publish ordering is the linchpin: readers never observe
//! an event whose bytes are not yet durable. An environmental failure on
//! the commit path fails every caller in the group and quiesces the writer;
//! appends then fail with `StoreUnhealthy` until the store is reopened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{MAX_ID_BYTES, StoreConfig};
use crate::error::{Result, StoreError};
use crate::index::{StreamIndex, StreamSnapshot};
use crate::record::{CRC_LEN, EventRecord, HEADER_LEN, encode_event, encode_trailer};
use crate::segment::{SegmentWriter, list_segments, recover_segment};

/// Tenant token that may cross tenant boundaries (ops/admin use).
pub const SYSTEM_TENANT: &str = "system";

/// Most caller batches coalesced into one fsync.
const MAX_GROUP: usize = 128;

/// File name of the optional index snapshot hint.
const SNAPSHOT_FILE: &str = "index.snapshot";

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// =============================================================================
// Public contract types
// =============================================================================

/// Optimistic-concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedRevision {
    /// The stream must not exist yet.
    NoStream,
    /// The stream's current revision must equal this value.
    Exact(u64),
    /// No expectation.
    Any,
}

impl std::fmt::Display for ExpectedRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoStream => write!(f, "none"),
            Self::Exact(rev) => write!(f, "{rev}"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// One stream append within a commit call.
#[derive(Debug, Clone)]
pub struct AppendCommand {
    /// Target stream.
    pub stream_id: String,
    /// Idempotency key, scoped to the stream.
    pub command_id: String,
    /// Revision expectation checked under the commit lock.
    pub expected: ExpectedRevision,
    /// Event payloads, appended in order.
    pub payloads: Vec<Vec<u8>>,
}

/// What a committed (or idempotently replayed) command produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub first_rev: u64,
    pub last_rev: u64,
    pub first_global_pos: u64,
    pub last_global_pos: u64,
}

/// Group-commit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    /// Caller batches durably committed.
    pub batches_committed: u64,
    /// Commit groups processed.
    pub group_commits: u64,
    /// Fsyncs issued on the commit path.
    pub fsyncs: u64,
    /// Callers that rode another caller's fsync.
    pub coalesced_callers: u64,
}

// =============================================================================
// Shared state
// =============================================================================

/// One segment's read-side view: dense offsets by global position.
#[derive(Debug)]
pub(crate) struct SegmentEntry {
    pub first_pos: u64,
    pub path: PathBuf,
    pub offsets: Vec<u64>,
}

/// Ordered segment table; binary-searchable by global position.
#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    pub entries: Vec<SegmentEntry>,
}

impl SegmentTable {
    /// Locate `pos`, returning the owning segment path and file offset.
    pub fn locate(&self, pos: u64) -> Option<(PathBuf, u64)> {
        let idx = self
            .entries
            .partition_point(|e| e.first_pos <= pos)
            .checked_sub(1)?;
        let entry = &self.entries[idx];
        let rel = pos.checked_sub(entry.first_pos)? as usize;
        entry
            .offsets
            .get(rel)
            .map(|&offset| (entry.path.clone(), offset))
    }
}

/// State shared between the writer task and readers.
#[derive(Debug)]
pub(crate) struct LogShared {
    pub events_dir: PathBuf,
    pub index: RwLock<StreamIndex>,
    pub segments: RwLock<SegmentTable>,
    /// Highest durable, published global position (0 = empty store).
    pub head: AtomicU64,
    healthy: AtomicBool,
    unhealthy_reason: Mutex<Option<String>>,
    batches_committed: AtomicU64,
    group_commits: AtomicU64,
    fsyncs: AtomicU64,
    coalesced_callers: AtomicU64,
}

impl LogShared {
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn unhealthy_reason(&self) -> Option<String> {
        self.unhealthy_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn quiesce(&self, reason: &str) {
        error!(reason, "commit path quiescing; store requires reopen");
        *self
            .unhealthy_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        self.healthy.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            group_commits: self.group_commits.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            coalesced_callers: self.coalesced_callers.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Event log
// =============================================================================

struct CommitRequest {
    commands: Vec<AppendCommand>,
    tenant_id: String,
    reply: oneshot::Sender<Result<Vec<AppendReceipt>>>,
}

/// Handle to the durable log: validates requests, hands them to the writer
/// task, and exposes the shared read-side state.
pub(crate) struct EventLog {
    shared: Arc<LogShared>,
    tx: mpsc::Sender<CommitRequest>,
    writer: tokio::task::JoinHandle<()>,
    cfg: StoreConfig,
}

impl EventLog {
    /// Open the log under `<root>/events`, running crash recovery, and start
    /// the writer task. Must be called within a Tokio runtime.
    pub fn open(root: &Path, cfg: StoreConfig) -> Result<Self> {
        let events_dir = root.join("events");
        std::fs::create_dir_all(&events_dir)?;

        let recovered = recover(&events_dir, &cfg)?;
        info!(
            head = recovered.head,
            segments = recovered.table.entries.len(),
            streams = recovered.index.stream_count(),
            "event log recovered"
        );

        let shared = Arc::new(LogShared {
            events_dir,
            index: RwLock::new(recovered.index),
            segments: RwLock::new(recovered.table),
            head: AtomicU64::new(recovered.head),
            healthy: AtomicBool::new(true),
            unhealthy_reason: Mutex::new(None),
            batches_committed: AtomicU64::new(0),
            group_commits: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
            coalesced_callers: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::channel(MAX_GROUP * 4);
        let task = WriterTask {
            shared: Arc::clone(&shared),
            segment: recovered.active,
            next_pos: recovered.head + 1,
            cfg: cfg.clone(),
            batches_since_snapshot: 0,
        };
        let writer = tokio::spawn(task.run(rx));

        Ok(Self {
            shared,
            tx,
            writer,
            cfg,
        })
    }

    pub fn shared(&self) -> Arc<LogShared> {
        Arc::clone(&self.shared)
    }

    /// Append events to a single stream.
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

    /// Append to multiple streams atomically: either every command commits
    /// or none does.
    pub async fn append_batch(
        &self,
        commands: Vec<AppendCommand>,
        tenant_id: &str,
    ) -> Result<Vec<AppendReceipt>> {
        self.validate(&commands, tenant_id)?;
        if !self.shared.is_healthy() {
            return Err(self.unhealthy_error());
        }

        let (reply, rx) = oneshot::channel();
        let request = CommitRequest {
            commands,
            tenant_id: tenant_id.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return Err(self.unhealthy_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.unhealthy_error()))
    }

    fn unhealthy_error(&self) -> StoreError {
        StoreError::StoreUnhealthy {
            reason: self
                .shared
                .unhealthy_reason()
                .unwrap_or_else(|| "writer stopped".to_string()),
        }
    }

    fn validate(&self, commands: &[AppendCommand], tenant_id: &str) -> Result<()> {
        if tenant_id.is_empty() || tenant_id.len() > MAX_ID_BYTES {
            return Err(StoreError::IdentifierTooLong {
                field: "tenant_id",
                actual: tenant_id.len(),
                max: MAX_ID_BYTES,
            });
        }
        if commands.is_empty() {
            return Err(StoreError::InvalidRequest(
                "append_batch requires at least one command".to_string(),
            ));
        }
        let total_events: usize = commands.iter().map(|c| c.payloads.len()).sum();
        if total_events > self.cfg.max_batch_events {
            return Err(StoreError::InvalidRequest(format!(
                "batch of {total_events} events exceeds max_batch_events {}",
                self.cfg.max_batch_events
            )));
        }
        for command in commands {
            if command.stream_id.is_empty() || command.stream_id.len() > MAX_ID_BYTES {
                return Err(StoreError::IdentifierTooLong {
                    field: "stream_id",
                    actual: command.stream_id.len(),
                    max: MAX_ID_BYTES,
                });
            }
            if command.command_id.is_empty() || command.command_id.len() > MAX_ID_BYTES {
                return Err(StoreError::IdentifierTooLong {
                    field: "command_id",
                    actual: command.command_id.len(),
                    max: MAX_ID_BYTES,
                });
            }
            if command.payloads.is_empty() {
                return Err(StoreError::InvalidRequest(
                    "append requires at least one event".to_string(),
                ));
            }
            for payload in &command.payloads {
                if payload.len() > self.cfg.max_payload_bytes {
                    return Err(StoreError::PayloadTooLarge {
                        actual: payload.len(),
                        max: self.cfg.max_payload_bytes,
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop the writer task after draining queued commits, flush durably,
    /// and write a final index snapshot.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.writer.await {
            warn!(error = %err, "writer task join failed during close");
        }
    }
}

/// SHA-256 over an ordered payload set; equal sets replay idempotently,
/// different sets are command-id reuse.
pub(crate) fn hash_payload_set(payloads: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for payload in payloads {
        hasher.update((payload.len() as u64).to_le_bytes());
        hasher.update(payload);
    }
    hasher.finalize().into()
}

// =============================================================================
// Writer task
// =============================================================================

struct WriterTask {
    shared: Arc<LogShared>,
    segment: SegmentWriter,
    next_pos: u64,
    cfg: StoreConfig,
    batches_since_snapshot: u64,
}

/// A validated request, ready for serialization.
struct PlannedRequest {
    reply: oneshot::Sender<Result<Vec<AppendReceipt>>>,
    outcomes: Vec<PlannedCommand>,
}

enum PlannedCommand {
    /// Idempotent replay of a prior commit; nothing is written.
    Replay(AppendReceipt),
    Fresh {
        stream_id: String,
        tenant_id: String,
        command_id: String,
        payload_hash: [u8; 32],
        first_rev: u64,
        payloads: Vec<Vec<u8>>,
    },
}

/// Revision/command effects planned but not yet durable, used to validate
/// later requests in the same group against earlier ones.
#[derive(Default)]
struct GroupOverlay {
    revs: HashMap<String, u64>,
    cmds: HashMap<(String, String), ([u8; 32], AppendReceipt)>,
    tenants: HashMap<String, String>,
}

/// One request serialized into the group buffer, pending fsync.
struct SerializedRequest {
    reply: oneshot::Sender<Result<Vec<AppendReceipt>>>,
    receipts: Vec<AppendReceipt>,
    commits: Vec<CommitEntry>,
    /// Byte range of this request's unit within the group buffer.
    bytes: std::ops::Range<usize>,
    /// `(global_pos, unit-relative offset)` per record, in write order.
    entries: Vec<(u64, u64)>,
}

/// Index update for one fresh command, applied after fsync.
struct CommitEntry {
    stream_id: String,
    tenant_id: String,
    command_id: String,
    payload_hash: [u8; 32],
    receipt: AppendReceipt,
    positions: Vec<u64>,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<CommitRequest>) {
        while let Some(first) = rx.recv().await {
            let mut group = vec![first];
            while group.len() < MAX_GROUP {
                match rx.try_recv() {
                    Ok(next) => group.push(next),
                    Err(_) => break,
                }
            }
            self.commit_group(group);
        }
        // Channel closed: final flush + snapshot, best effort.
        if self.shared.is_healthy() {
            if let Err(err) = self.segment.sync() {
                warn!(error = %err, "final sync failed during close");
            }
            if self.cfg.index_snapshot_interval_batches > 0 {
                if let Err(err) = write_snapshot(&self.shared) {
                    warn!(error = %err, "final index snapshot failed");
                }
            }
        }
        info!("writer task stopped");
    }

    fn commit_group(&mut self, group: Vec<CommitRequest>) {
        if !self.shared.is_healthy() {
            let reason = self
                .shared
                .unhealthy_reason()
                .unwrap_or_else(|| "store unhealthy".to_string());
            for request in group {
                let _ = request.reply.send(Err(StoreError::StoreUnhealthy {
                    reason: reason.clone(),
                }));
            }
            return;
        }

        let group_len = group.len();
        let planned = self.plan(group);
        let (serialized, buf, next_pos) = self.serialize(planned);
        if serialized.is_empty() {
            return;
        }

        // Roll before writing so the whole group lands in one segment.
        if self.segment.should_roll(buf.len() as u64) {
            if let Err(err) = self.segment.roll(self.next_pos) {
                self.fail_group(serialized, &err);
                return;
            }
        }

        // Fix up trailer entry offsets now that the segment base is known.
        let base = self.segment.len_bytes();
        let mut buf = buf;
        for request in &serialized {
            fixup_trailer_offsets(
                &mut buf[request.bytes.clone()],
                base + request.bytes.start as u64,
                request.entries.len(),
            );
        }

        // Write + fsync: the durability point for every caller in the group.
        if let Err(err) = self.segment.append(&buf) {
            self.fail_group(serialized, &err);
            return;
        }
        if self.cfg.fsync_on_commit {
            if let Err(err) = self.segment.sync() {
                self.fail_group(serialized, &err);
                return;
            }
            self.shared.fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        // Publish: index first, then the segment table, then the head. Only
        // now do readers observe the new records.
        let committed_batches = serialized.len() as u64;
        {
            let mut index = self
                .shared
                .index
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for request in &serialized {
                for entry in &request.commits {
                    index.record_commit(
                        &entry.stream_id,
                        &entry.tenant_id,
                        &entry.command_id,
                        entry.payload_hash,
                        &entry.receipt,
                        &entry.positions,
                    );
                }
            }
        }
        {
            let mut segments = self
                .shared
                .segments
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let needs_entry = segments
                .entries
                .last()
                .is_none_or(|e| e.path != self.segment.path());
            if needs_entry {
                segments.entries.push(SegmentEntry {
                    first_pos: self.segment.first_pos(),
                    path: self.segment.path().to_path_buf(),
                    offsets: Vec::new(),
                });
            }
            if let Some(entry) = segments.entries.last_mut() {
                for request in &serialized {
                    let unit_base = base + request.bytes.start as u64;
                    for &(_, rel) in &request.entries {
                        entry.offsets.push(unit_base + rel);
                    }
                }
            }
        }
        self.next_pos = next_pos;
        self.shared.head.store(next_pos - 1, Ordering::Release);

        self.shared
            .batches_committed
            .fetch_add(committed_batches, Ordering::Relaxed);
        self.shared.group_commits.fetch_add(1, Ordering::Relaxed);
        self.shared
            .coalesced_callers
            .fetch_add(group_len as u64 - 1, Ordering::Relaxed);

        debug!(
            group = group_len,
            batches = committed_batches,
            head = next_pos - 1,
            "commit group durable"
        );

        for request in serialized {
            let _ = request.reply.send(Ok(request.receipts));
        }

        // Periodic index snapshot, strictly best effort.
        self.batches_since_snapshot += committed_batches;
        if self.cfg.index_snapshot_interval_batches > 0
            && self.batches_since_snapshot >= self.cfg.index_snapshot_interval_batches
        {
            self.batches_since_snapshot = 0;
            if let Err(err) = write_snapshot(&self.shared) {
                warn!(error = %err, "index snapshot write failed");
            }
        }
    }

    /// Validate each request against the index plus the effects of earlier
    /// requests in the same group. Failed requests are replied to here and
    /// drop out of the group; they never abort their neighbours.
    fn plan(&self, group: Vec<CommitRequest>) -> Vec<PlannedRequest> {
        let index = self
            .shared
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut overlay = GroupOverlay::default();
        let mut next_pos = self.next_pos;

        let mut out = Vec::new();
        for request in group {
            match plan_request(
                &index,
                &mut overlay,
                &mut next_pos,
                &request.commands,
                &request.tenant_id,
            ) {
                Ok(outcomes) => out.push(PlannedRequest {
                    reply: request.reply,
                    outcomes,
                }),
                Err(err) => {
                    let _ = request.reply.send(Err(err));
                }
            }
        }
        out
    }

    /// Serialize every planned request into one group buffer. Pure-replay
    /// requests are answered immediately and never enter the buffer.
    fn serialize(
        &self,
        planned: Vec<PlannedRequest>,
    ) -> (Vec<SerializedRequest>, Vec<u8>, u64) {
        let timestamp_ms = now_ms();
        let mut pos = self.next_pos;
        let mut buf: Vec<u8> = Vec::new();
        let mut out: Vec<SerializedRequest> = Vec::new();

        for request in planned {
            let unit_start = buf.len();
            let mut records_buf: Vec<u8> = Vec::new();
            let mut entries: Vec<(u64, u64)> = Vec::new();
            let mut receipts = Vec::with_capacity(request.outcomes.len());
            let mut commits = Vec::new();

            for outcome in request.outcomes {
                match outcome {
                    PlannedCommand::Replay(receipt) => receipts.push(receipt),
                    PlannedCommand::Fresh {
                        stream_id,
                        tenant_id,
                        command_id,
                        payload_hash,
                        first_rev,
                        payloads,
                    } => {
                        let first_pos = pos;
                        let mut positions = Vec::with_capacity(payloads.len());
                        for (i, payload) in payloads.into_iter().enumerate() {
                            let record = EventRecord {
                                global_pos: pos,
                                stream_id: stream_id.clone(),
                                stream_rev: first_rev + i as u64,
                                tenant_id: tenant_id.clone(),
                                command_id: command_id.clone(),
                                timestamp_ms,
                                payload,
                            };
                            entries.push((pos, records_buf.len() as u64));
                            encode_event(&record, &mut records_buf);
                            positions.push(pos);
                            pos += 1;
                        }
                        let receipt = AppendReceipt {
                            first_rev,
                            last_rev: first_rev + positions.len() as u64 - 1,
                            first_global_pos: first_pos,
                            last_global_pos: pos - 1,
                        };
                        receipts.push(receipt.clone());
                        commits.push(CommitEntry {
                            stream_id,
                            tenant_id,
                            command_id,
                            payload_hash,
                            receipt,
                            positions,
                        });
                    }
                }
            }

            if entries.is_empty() {
                let _ = request.reply.send(Ok(receipts));
                continue;
            }

            let batch_crc = crc32c::crc32c(&records_buf);
            let last_pos = entries.last().map_or(0, |&(p, _)| p);
            buf.extend_from_slice(&records_buf);
            // Entry offsets are unit-relative here; they are rewritten to
            // absolute file offsets once the roll decision pins the base.
            encode_trailer(last_pos, timestamp_ms, &entries, batch_crc, &mut buf);

            out.push(SerializedRequest {
                reply: request.reply,
                receipts,
                commits,
                bytes: unit_start..buf.len(),
                entries,
            });
        }

        (out, buf, pos)
    }

    fn fail_group(&self, serialized: Vec<SerializedRequest>, err: &StoreError) {
        if err.is_quiescing() {
            self.shared.quiesce(&err.to_string());
        }
        for request in serialized {
            let _ = request.reply.send(Err(replicate_error(err)));
        }
    }
}

/// Plan one request: every command either replays idempotently or passes
/// its revision check, or the whole request fails. On success the request's
/// effects are merged into the group overlay.
fn plan_request(
    index: &StreamIndex,
    overlay: &mut GroupOverlay,
    next_pos: &mut u64,
    commands: &[AppendCommand],
    tenant_id: &str,
) -> Result<Vec<PlannedCommand>> {
    let mut outcomes = Vec::with_capacity(commands.len());
    let mut tentative = GroupOverlay::default();
    let mut pos = *next_pos;

    for command in commands {
        let state = index.state(&command.stream_id);

        // A stream belongs to the tenant that created it; only the system
        // token may append across tenants.
        let owner = tentative
            .tenants
            .get(&command.stream_id)
            .or_else(|| overlay.tenants.get(&command.stream_id))
            .map(String::as_str)
            .or_else(|| state.map(|s| s.tenant_id.as_str()));
        if let Some(owner) = owner {
            if owner != tenant_id && tenant_id != SYSTEM_TENANT {
                return Err(StoreError::TenantMismatch);
            }
        }

        // Idempotency first: an exact replay succeeds with the original
        // receipt regardless of the stream's current revision.
        let hash = hash_payload_set(&command.payloads);
        let cmd_key = (command.stream_id.clone(), command.command_id.clone());
        let prior = tentative
            .cmds
            .get(&cmd_key)
            .or_else(|| overlay.cmds.get(&cmd_key))
            .cloned()
            .or_else(|| {
                state
                    .and_then(|s| s.commands.get(&command.command_id))
                    .map(|e| (e.payload_hash, e.receipt.clone()))
            });
        if let Some((prior_hash, prior_receipt)) = prior {
            if prior_hash == hash {
                outcomes.push(PlannedCommand::Replay(prior_receipt));
                continue;
            }
            return Err(StoreError::CommandIdReuse {
                stream: command.stream_id.clone(),
                command_id: command.command_id.clone(),
            });
        }

        let current_rev = tentative
            .revs
            .get(&command.stream_id)
            .or_else(|| overlay.revs.get(&command.stream_id))
            .copied()
            .or_else(|| state.map(|s| s.current_rev))
            .unwrap_or(0);

        let matches = match command.expected {
            ExpectedRevision::NoStream => current_rev == 0,
            ExpectedRevision::Exact(rev) => current_rev == rev,
            ExpectedRevision::Any => true,
        };
        if !matches {
            return Err(StoreError::RevisionConflict {
                stream: command.stream_id.clone(),
                expected: command.expected.to_string(),
                actual: current_rev,
            });
        }

        let first_rev = current_rev + 1;
        let last_rev = current_rev + command.payloads.len() as u64;
        let first_pos = pos;
        let last_pos = pos + command.payloads.len() as u64 - 1;
        pos = last_pos + 1;

        tentative.revs.insert(command.stream_id.clone(), last_rev);
        tentative
            .tenants
            .insert(command.stream_id.clone(), tenant_id.to_string());
        tentative.cmds.insert(
            cmd_key,
            (
                hash,
                AppendReceipt {
                    first_rev,
                    last_rev,
                    first_global_pos: first_pos,
                    last_global_pos: last_pos,
                },
            ),
        );
        outcomes.push(PlannedCommand::Fresh {
            stream_id: command.stream_id.clone(),
            tenant_id: tenant_id.to_string(),
            command_id: command.command_id.clone(),
            payload_hash: hash,
            first_rev,
            payloads: command.payloads.clone(),
        });
    }

    overlay.revs.extend(tentative.revs);
    overlay.cmds.extend(tentative.cmds);
    overlay.tenants.extend(tentative.tenants);
    *next_pos = pos;
    Ok(outcomes)
}

/// Errors are not `Clone`; rebuild an equivalent error per caller.
fn replicate_error(err: &StoreError) -> StoreError {
    match err {
        StoreError::StorageFull(msg) => StoreError::StorageFull(msg.clone()),
        other => StoreError::StoreUnhealthy {
            reason: other.to_string(),
        },
    }
}

/// Rewrite the trailer's unit-relative entry offsets to absolute file
/// offsets and recompute the trailer record's CRC. The trailer is the last
/// frame of `unit` and carries `entry_count` entries.
fn fixup_trailer_offsets(unit: &mut [u8], unit_file_base: u64, entry_count: usize) {
    let trailer_len = HEADER_LEN + 4 + entry_count * 16 + 4 + CRC_LEN;
    let trailer_start = unit.len() - trailer_len;
    let trailer = &mut unit[trailer_start..];
    for i in 0..entry_count {
        let at = HEADER_LEN + 4 + i * 16 + 8;
        let mut rel = [0u8; 8];
        rel.copy_from_slice(&trailer[at..at + 8]);
        let abs = unit_file_base + u64::from_le_bytes(rel);
        trailer[at..at + 8].copy_from_slice(&abs.to_le_bytes());
    }
    let crc_at = trailer_len - CRC_LEN;
    let crc = crc32c::crc32c(&trailer[..crc_at]);
    trailer[crc_at..].copy_from_slice(&crc.to_le_bytes());
}

// =============================================================================
// Recovery
// =============================================================================

struct Recovered {
    index: StreamIndex,
    table: SegmentTable,
    head: u64,
    active: SegmentWriter,
}

/// Serialized index snapshot: a recovery accelerator, validated against the
/// on-disk segments and discarded wholesale on any mismatch.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    head: u64,
    segments: Vec<SegmentSnapshot>,
    streams: HashMap<String, StreamSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentSnapshot {
    first_pos: u64,
    byte_len: u64,
    offsets: Vec<u64>,
}

/// Rebuilds stream states and command receipts from a forward scan.
/// Records of one command are contiguous within a stream, so the builder
/// accumulates until the command id changes, then flushes a ledger entry.
struct IndexRebuilder {
    index: StreamIndex,
    open: HashMap<String, OpenCommand>,
}

struct OpenCommand {
    command_id: String,
    tenant_id: String,
    payloads: Vec<Vec<u8>>,
    first_rev: u64,
    first_pos: u64,
    last_rev: u64,
    last_pos: u64,
    positions: Vec<u64>,
}

impl IndexRebuilder {
    fn new(cache_cap: usize) -> Self {
        Self {
            index: StreamIndex::new(cache_cap),
            open: HashMap::new(),
        }
    }

    fn on_event(&mut self, record: EventRecord) {
        let switch = self
            .open
            .get(&record.stream_id)
            .is_some_and(|open| open.command_id != record.command_id);
        if switch {
            if let Some(open) = self.open.remove(&record.stream_id) {
                self.flush(&record.stream_id, open);
            }
        }
        let open = self
            .open
            .entry(record.stream_id.clone())
            .or_insert_with(|| OpenCommand {
                command_id: record.command_id.clone(),
                tenant_id: record.tenant_id.clone(),
                payloads: Vec::new(),
                first_rev: record.stream_rev,
                first_pos: record.global_pos,
                last_rev: record.stream_rev,
                last_pos: record.global_pos,
                positions: Vec::new(),
            });
        open.last_rev = record.stream_rev;
        open.last_pos = record.global_pos;
        open.positions.push(record.global_pos);
        open.payloads.push(record.payload);
    }

    fn flush(&mut self, stream_id: &str, open: OpenCommand) {
        let receipt = AppendReceipt {
            first_rev: open.first_rev,
            last_rev: open.last_rev,
            first_global_pos: open.first_pos,
            last_global_pos: open.last_pos,
        };
        self.index.record_commit(
            stream_id,
            &open.tenant_id,
            &open.command_id,
            hash_payload_set(&open.payloads),
            &receipt,
            &open.positions,
        );
    }

    fn finish(mut self) -> StreamIndex {
        let open: Vec<(String, OpenCommand)> = self.open.drain().collect();
        for (stream_id, cmd) in open {
            self.flush(&stream_id, cmd);
        }
        self.index
    }
}

fn snapshot_path(events_dir: &Path) -> PathBuf {
    events_dir.join(SNAPSHOT_FILE)
}

fn load_snapshot(events_dir: &Path) -> Option<IndexSnapshot> {
    let path = snapshot_path(events_dir);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(error = %err, "ignoring unreadable index snapshot");
            None
        }
    }
}

fn write_snapshot(shared: &LogShared) -> Result<()> {
    let snapshot = {
        let index = shared.index.read().unwrap_or_else(PoisonError::into_inner);
        let segments = shared
            .segments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        IndexSnapshot {
            head: shared.head(),
            segments: segments
                .entries
                .iter()
                .map(|entry| SegmentSnapshot {
                    first_pos: entry.first_pos,
                    byte_len: segment_len_on_disk(&entry.path),
                    offsets: entry.offsets.clone(),
                })
                .collect(),
            streams: index.to_snapshot(),
        }
    };
    let path = snapshot_path(&shared.events_dir);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
    std::fs::rename(&tmp, &path)?;
    debug!(head = snapshot.head, "index snapshot written");
    Ok(())
}

fn segment_len_on_disk(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

fn recover(events_dir: &Path, cfg: &StoreConfig) -> Result<Recovered> {
    let on_disk = list_segments(events_dir)?;

    if on_disk.is_empty() {
        let active = SegmentWriter::create(events_dir, 1, cfg.segment_max_bytes)?;
        return Ok(Recovered {
            index: StreamIndex::new(cfg.locator_cache_streams),
            table: SegmentTable::default(),
            head: 0,
            active,
        });
    }

    let snapshot = load_snapshot(events_dir).filter(|snap| snapshot_matches(snap, &on_disk));
    let snapshot_head = snapshot.as_ref().map_or(0, |s| s.head);

    let mut rebuilder = IndexRebuilder::new(cfg.locator_cache_streams);
    let mut table = SegmentTable::default();
    let mut expected_next = 1u64;

    // Segments the snapshot fully describes (byte length unchanged) are
    // trusted without a scan; everything else is scanned record-by-record.
    let mut trusted: HashMap<u64, SegmentSnapshot> = HashMap::new();
    if let Some(snap) = snapshot {
        debug!(head = snap.head, "recovering with index snapshot hint");
        rebuilder.index.load_snapshot(snap.streams);
        for seg in snap.segments {
            trusted.insert(seg.first_pos, seg);
        }
    }

    let last_first = on_disk
        .last()
        .map(|(first, _)| *first)
        .unwrap_or_default();

    for (first_pos, path) in &on_disk {
        if *first_pos != expected_next && !table.entries.is_empty() {
            return Err(StoreError::Corrupted {
                segment: path.clone(),
                offset: 0,
                reason: format!("segment starts at {first_pos}, expected {expected_next}"),
            });
        }

        let hinted = trusted.remove(first_pos);
        let unchanged = hinted
            .as_ref()
            .is_some_and(|seg| segment_len_on_disk(path) == seg.byte_len);

        let offsets = if let (Some(seg), true) = (hinted, unchanged) {
            seg.offsets
        } else {
            // Scan; events already covered by the snapshot's stream states
            // must not be applied twice.
            let scan = recover_segment(*first_pos, path, &mut |record, _offset| {
                if record.global_pos > snapshot_head {
                    rebuilder.on_event(record);
                }
            })?;
            scan.offsets
        };

        expected_next = *first_pos + offsets.len() as u64;
        table.entries.push(SegmentEntry {
            first_pos: *first_pos,
            path: path.clone(),
            offsets,
        });
    }

    let head = expected_next - 1;
    let index = rebuilder.finish();

    let valid_len = table
        .entries
        .last()
        .map_or(0, |entry| segment_len_on_disk(&entry.path));
    let active = SegmentWriter::reopen(events_dir, last_first, valid_len, cfg.segment_max_bytes)?;

    // Segments that never saw a commit have no read-side entry.
    table.entries.retain(|entry| !entry.offsets.is_empty());

    Ok(Recovered {
        index,
        table,
        head,
        active,
    })
}

/// A snapshot is usable only if every segment it describes still exists
/// with at least the recorded byte length.
fn snapshot_matches(snapshot: &IndexSnapshot, on_disk: &[(u64, PathBuf)]) -> bool {
    snapshot.segments.iter().all(|seg| {
        on_disk
            .iter()
            .find(|(first, _)| *first == seg.first_pos)
            .is_some_and(|(_, path)| segment_len_on_disk(path) >= seg.byte_len)
    })
}
