//! In-memory stream index.
//!
//! Maps `stream_id` to its current revision, head position, per-revision
//! locators, and the command-id ledger used for idempotent replays. The
//! index is updated strictly after the corresponding log fsync and is fully
//! rebuildable from segment scans; the optional snapshot file is a recovery
//! accelerator, never a source of truth.
//!
//! Locator lists for cold streams may be evicted by a bounded LRU; a read
//! that misses rebuilds them from the owning segments and reinstalls them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::log::AppendReceipt;

/// Prior commit of a command id within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandEntry {
    /// SHA-256 over the command's ordered payload set.
    pub payload_hash: [u8; 32],
    /// Receipt returned by the original commit, replayed verbatim on an
    /// identical retry.
    pub receipt: AppendReceipt,
}

/// Everything the store knows about one stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamState {
    /// Highest committed revision (0 = stream exists in name only; never
    /// stored — a stream comes into being with revision 1).
    pub current_rev: u64,
    /// Global position of the stream's newest record.
    pub head_global_pos: u64,
    /// Tenant that owns the stream (the tenant of its first record).
    pub tenant_id: String,
    /// Command-id ledger for idempotency checks.
    pub commands: HashMap<String, CommandEntry>,
    /// `locators[r - 1]` is the global position of revision `r`.
    /// `None` when evicted; rebuilt on demand from segments.
    pub locators: Option<Vec<u64>>,
}

/// Outcome of a locator lookup.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LocatorQuery {
    /// The stream does not exist.
    NoStream,
    /// Locators were evicted; the caller must rebuild them.
    Evicted,
    /// Global positions for the requested revisions, in revision order.
    Range(Vec<u64>),
}

// =============================================================================
// Stream index
// =============================================================================

#[derive(Debug)]
pub(crate) struct StreamIndex {
    streams: HashMap<String, StreamState>,
    /// Recency order over streams whose locators are materialized.
    lru: LruList,
    cache_cap: usize,
}

impl StreamIndex {
    pub fn new(cache_cap: usize) -> Self {
        Self {
            streams: HashMap::new(),
            lru: LruList::new(),
            cache_cap,
        }
    }

    pub fn state(&self, stream_id: &str) -> Option<&StreamState> {
        self.streams.get(stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Record a committed append: extend (or create) the stream state and
    /// remember the command receipt. Called only after the batch is durable.
    pub fn record_commit(
        &mut self,
        stream_id: &str,
        tenant_id: &str,
        command_id: &str,
        payload_hash: [u8; 32],
        receipt: &AppendReceipt,
        positions: &[u64],
    ) {
        let state = self.streams.entry(stream_id.to_string()).or_insert_with(|| {
            StreamState {
                tenant_id: tenant_id.to_string(),
                locators: Some(Vec::new()),
                ..StreamState::default()
            }
        });

        state.current_rev = receipt.last_rev;
        state.head_global_pos = receipt.last_global_pos;
        state.commands.insert(
            command_id.to_string(),
            CommandEntry {
                payload_hash,
                receipt: receipt.clone(),
            },
        );
        if let Some(locators) = state.locators.as_mut() {
            locators.extend_from_slice(positions);
            self.lru.touch(stream_id);
            self.evict_over_cap();
        }
    }

    /// Look up global positions for revisions `from_rev ..` (at most `max`).
    pub fn locators(&self, stream_id: &str, from_rev: u64, max: usize) -> LocatorQuery {
        let Some(state) = self.streams.get(stream_id) else {
            return LocatorQuery::NoStream;
        };
        let Some(locators) = state.locators.as_ref() else {
            return LocatorQuery::Evicted;
        };
        let from = from_rev.max(1);
        if from > state.current_rev {
            return LocatorQuery::Range(Vec::new());
        }
        let start = (from - 1) as usize;
        let end = locators.len().min(start + max);
        LocatorQuery::Range(locators[start..end].to_vec())
    }

    /// Reinstall locators rebuilt from segments after an eviction.
    pub fn install_locators(&mut self, stream_id: &str, locators: Vec<u64>) {
        if let Some(state) = self.streams.get_mut(stream_id) {
            // A commit may have landed between the rebuild scan and this
            // install; keep the newer view in that case.
            if locators.len() as u64 == state.current_rev {
                state.locators = Some(locators);
                self.lru.touch(stream_id);
                self.evict_over_cap();
            }
        }
    }

    fn evict_over_cap(&mut self) {
        while self.lru.len() > self.cache_cap {
            if let Some(coldest) = self.lru.pop_coldest() {
                if let Some(state) = self.streams.get_mut(&coldest) {
                    state.locators = None;
                }
            } else {
                break;
            }
        }
    }

    // ---- Snapshot support ----

    pub fn to_snapshot(&self) -> HashMap<String, StreamSnapshot> {
        self.streams
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    StreamSnapshot {
                        current_rev: state.current_rev,
                        head_global_pos: state.head_global_pos,
                        tenant_id: state.tenant_id.clone(),
                        commands: state.commands.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn load_snapshot(&mut self, streams: HashMap<String, StreamSnapshot>) {
        for (id, snap) in streams {
            self.streams.insert(
                id,
                StreamState {
                    current_rev: snap.current_rev,
                    head_global_pos: snap.head_global_pos,
                    tenant_id: snap.tenant_id,
                    commands: snap.commands,
                    locators: None,
                },
            );
        }
    }
}

/// Persisted form of a stream state. Locators are omitted; they are
/// rebuilt lazily from segment offset tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StreamSnapshot {
    pub current_rev: u64,
    pub head_global_pos: u64,
    pub tenant_id: String,
    pub commands: HashMap<String, CommandEntry>,
}

// =============================================================================
// Arena LRU
// =============================================================================

const SENTINEL: usize = usize::MAX;

#[derive(Debug)]
struct LruNode {
    key: String,
    prev: usize,
    next: usize,
}

/// Recency list over stream ids: arena-based doubly-linked list with a
/// HashMap side index, O(1) touch and pop, no unsafe.
#[derive(Debug)]
struct LruList {
    nodes: Vec<LruNode>,
    slots: HashMap<String, usize>,
    free: Vec<usize>,
    hottest: usize,
    coldest: usize,
}

impl LruList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            slots: HashMap::new(),
            free: Vec::new(),
            hottest: SENTINEL,
            coldest: SENTINEL,
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Mark `key` most recently used, inserting it if absent.
    fn touch(&mut self, key: &str) {
        if let Some(&idx) = self.slots.get(key) {
            self.unlink(idx);
            self.link_front(idx);
            return;
        }
        let node = LruNode {
            key: key.to_string(),
            prev: SENTINEL,
            next: SENTINEL,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.slots.insert(key.to_string(), idx);
        self.link_front(idx);
    }

    /// Remove and return the least recently used key.
    fn pop_coldest(&mut self) -> Option<String> {
        let idx = self.coldest;
        if idx == SENTINEL {
            return None;
        }
        self.unlink(idx);
        self.free.push(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.slots.remove(&key);
        Some(key)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == SENTINEL {
            self.hottest = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == SENTINEL {
            self.coldest = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = SENTINEL;
        self.nodes[idx].next = SENTINEL;
    }

    fn link_front(&mut self, idx: usize) {
        self.nodes[idx].prev = SENTINEL;
        self.nodes[idx].next = self.hottest;
        if self.hottest != SENTINEL {
            self.nodes[self.hottest].prev = idx;
        }
        self.hottest = idx;
        if self.coldest == SENTINEL {
            self.coldest = idx;
        }
    }
}
