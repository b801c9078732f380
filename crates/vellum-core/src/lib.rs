//! vellum-core: embedded append-only event store with projections.
//!
//! An embeddable event log with per-stream optimistic concurrency, a
//! monotonic global order, and an at-least-once projection runtime that
//! materializes derived tables under strict tenant isolation with
//! exactly-once checkpointing.
//!
//! # Architecture
//!
//! ```text
//! caller ──► admission controller ──► writer task ──► segment + fsync
//!                                          │
//!                                   stream index / global head
//!                                          │
//!            projection workers ◄── reader (stream + global)
//!                   │
//!            handlers ──► staged views ──► state store (ops + checkpoint)
//! ```
//!
//! # Modules
//!
//! - `store`: the [`Store`] facade owning every background worker
//! - `log`: writer task, group commit, commit protocol, recovery
//! - `segment`: on-disk framing, batch trailers, torn-tail truncation
//! - `record`: event records and the CRC-protected wire format
//! - `index`: stream states, command-id ledger, locator LRU
//! - `reader`: tenant-checked stream reads and trusted global reads
//! - `admission`: closed-loop p99-targeting write admission
//! - `projection`: schemas, handler contract, staged views
//! - `projection_store`: SQLite-backed tenant-scoped tables
//! - `coordinator`: per-projection workers and the manual pump
//! - `config`: all tunables, validated before open
//! - `error`: every caller-visible failure with a stable class mapping
//! - `logging`: tracing subscriber setup for embedders that want it
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod log;
pub mod logging;
pub mod projection;
pub mod projection_store;
pub mod reader;
pub mod record;
pub mod segment;
pub mod store;

pub use admission::AdmissionMetrics;
pub use config::{AdmissionConfig, ProjectionConfig, StoreConfig};
pub use coordinator::{ProjectionBatch, ProjectionLag, WorkerState};
pub use error::{ErrorClass, Result, StoreError};
pub use log::{
    AppendCommand, AppendReceipt, ExpectedRevision, SYSTEM_TENANT, WriterStats,
};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use projection::{
    ColumnSpec, ColumnType, ErrorVerdict, ProjectionDef, ProjectionError, ProjectionHandler, Row,
    RowSource, StagedView, TableOp, TableSchema,
};
pub use record::EventRecord;
pub use store::{Store, StoreHealth};
