//! Projection definitions: table schemas, row ops, the handler contract,
//! and the staged table view handlers write through.
//!
//! A projection is a deterministic function from events to table ops plus a
//! checkpoint. Determinism is a registration contract: after a crash the
//! worker re-delivers the uncommitted batch, and the handler must produce
//! the same ops for the same events. The optional replay check
//! (`deterministic_replay_check`) re-runs each batch twice and diffs the op
//! lists to surface violations loudly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, StoreError};
use crate::record::EventRecord;

/// Column types supported by projection tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Base64-encoded bytes.
    Blob,
}

/// One column of a projection table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

/// Table shape fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    /// Name of the primary-key column; uniqueness is scoped per tenant.
    pub primary_key: String,
}

impl TableSchema {
    /// Build a schema from `(name, type)` pairs plus the primary key.
    pub fn new(
        columns: impl IntoIterator<Item = (impl Into<String>, ColumnType)>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, column_type)| ColumnSpec {
                    name: name.into(),
                    column_type,
                })
                .collect(),
            primary_key: primary_key.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StoreError::InvalidConfig(
                "projection schema needs at least one column".to_string(),
            ));
        }
        if !self.columns.iter().any(|c| c.name == self.primary_key) {
            return Err(StoreError::InvalidConfig(format!(
                "primary key {} is not a schema column",
                self.primary_key
            )));
        }
        Ok(())
    }

    fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check a row against the schema; the primary-key column must be
    /// present and render to `key`.
    pub(crate) fn check_row(&self, key: &str, row: &Row) -> std::result::Result<(), String> {
        for (name, value) in row {
            let Some(spec) = self.column(name) else {
                return Err(format!("column {name} not in schema"));
            };
            if value.is_null() {
                if name == &self.primary_key {
                    return Err("primary key must not be null".to_string());
                }
                continue;
            }
            let ok = match spec.column_type {
                ColumnType::Text | ColumnType::Blob => value.is_string(),
                ColumnType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
                ColumnType::Real => value.is_number(),
                ColumnType::Boolean => value.is_boolean(),
            };
            if !ok {
                return Err(format!("column {name} has wrong type for {value}"));
            }
        }
        match row.get(&self.primary_key) {
            None => Err(format!("row is missing primary key {}", self.primary_key)),
            Some(value) => {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if rendered == key {
                    Ok(())
                } else {
                    Err(format!(
                        "primary key value {rendered} does not match row key {key}"
                    ))
                }
            }
        }
    }
}

/// A materialized row: column name to JSON value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// One buffered table operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum TableOp {
    Upsert { key: String, row: Row },
    Delete { key: String },
}

/// Handler failure carried to the `on_error` policy.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The handler itself failed on an event.
    #[error("handler error: {0}")]
    Handler(String),

    /// The state store failed while the handler was reading.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProjectionError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// What to do about a handler error on one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorVerdict {
    /// Record the event's position as progress and move on.
    Skip,
    /// Re-run the handler once against the pre-event view; a second
    /// failure escalates to `Stop`.
    Retry,
    /// Fail the projection; only a restart recovers it.
    Stop,
}

/// User projection logic. `apply` must be deterministic: same event, same
/// staged state, same ops.
pub trait ProjectionHandler: Send + Sync + 'static {
    /// Transform one event into table ops via the staged view.
    fn apply(
        &self,
        event: &EventRecord,
        table: &mut StagedView<'_>,
    ) -> std::result::Result<(), ProjectionError>;

    /// Which tenant's staged view the handler receives for this event.
    fn tenant_id(&self, event: &EventRecord) -> String {
        event.tenant_id.clone()
    }

    /// Event filter; positions of filtered events still advance the
    /// checkpoint.
    fn applies_to(&self, _event: &EventRecord) -> bool {
        true
    }

    /// Error policy for a failed `apply`.
    fn on_error(&self, _err: &ProjectionError, _event: &EventRecord) -> ErrorVerdict {
        ErrorVerdict::Stop
    }
}

/// Registration of one projection.
#[derive(Clone)]
pub struct ProjectionDef {
    pub name: String,
    pub schema: TableSchema,
    pub handler: Arc<dyn ProjectionHandler>,
    /// Events fetched per batch; `None` uses the store default.
    pub batch_size: Option<usize>,
    /// Idle poll delay; `None` uses the store default.
    pub poll_interval_ms: Option<u64>,
}

impl ProjectionDef {
    pub fn new(
        name: impl Into<String>,
        schema: TableSchema,
        handler: impl ProjectionHandler,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            handler: Arc::new(handler),
            batch_size: None,
            poll_interval_ms: None,
        }
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = Some(poll_interval_ms);
        self
    }
}

impl std::fmt::Debug for ProjectionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDef")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("batch_size", &self.batch_size)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Staged view
// =============================================================================

/// Read access to committed rows, implemented by the state store.
pub trait RowSource {
    fn read_row(&self, tenant_id: &str, key: &str) -> Result<Option<Row>>;
}

/// Tenant-scoped staging surface handed to handlers.
///
/// Reads see the committed state plus earlier in-batch writes for the same
/// tenant; writes buffer an ordered op list that is flushed atomically with
/// the checkpoint advance at commit. Nothing touches the state store until
/// then.
pub struct StagedView<'a> {
    source: &'a dyn RowSource,
    tenant_id: String,
    /// In-batch effects: `Some(row)` from an upsert, `None` from a delete.
    overlay: HashMap<String, Option<Row>>,
    ops: Vec<TableOp>,
}

/// Rollback point taken before each event is applied.
pub(crate) struct StagedSnapshot {
    ops_len: usize,
    overlay: HashMap<String, Option<Row>>,
}

impl<'a> StagedView<'a> {
    pub(crate) fn new(source: &'a dyn RowSource, tenant_id: String) -> Self {
        Self {
            source,
            tenant_id,
            overlay: HashMap::new(),
            ops: Vec::new(),
        }
    }

    /// Read a row as the batch would leave it so far.
    pub fn get(&self, key: &str) -> std::result::Result<Option<Row>, ProjectionError> {
        if let Some(staged) = self.overlay.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.source.read_row(&self.tenant_id, key)?)
    }

    /// Buffer an upsert, visible to later `get`s in the same batch.
    pub fn set(&mut self, key: impl Into<String>, row: Row) {
        let key = key.into();
        self.overlay.insert(key.clone(), Some(row.clone()));
        self.ops.push(TableOp::Upsert { key, row });
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.overlay.insert(key.clone(), None);
        self.ops.push(TableOp::Delete { key });
    }

    /// Tenant this view is scoped to.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub(crate) fn snapshot(&self) -> StagedSnapshot {
        StagedSnapshot {
            ops_len: self.ops.len(),
            overlay: self.overlay.clone(),
        }
    }

    /// Rewind to a pre-event snapshot, discarding that event's partial ops.
    pub(crate) fn restore(&mut self, snapshot: StagedSnapshot) {
        self.ops.truncate(snapshot.ops_len);
        self.overlay = snapshot.overlay;
    }

    pub(crate) fn into_ops(self) -> Vec<TableOp> {
        self.ops
    }

    pub(crate) fn ops(&self) -> &[TableOp] {
        &self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(
            [
                ("id", ColumnType::Text),
                ("n", ColumnType::Integer),
                ("note", ColumnType::Text),
            ],
            "id",
        )
    }

    fn row(id: &str, n: i64) -> Row {
        Row::from([
            ("id".to_string(), json!(id)),
            ("n".to_string(), json!(n)),
        ])
    }

    struct MapSource(HashMap<(String, String), Row>);

    impl RowSource for MapSource {
        fn read_row(&self, tenant_id: &str, key: &str) -> Result<Option<Row>> {
            Ok(self
                .0
                .get(&(tenant_id.to_string(), key.to_string()))
                .cloned())
        }
    }

    // ---- Schema checks ----

    #[test]
    fn schema_requires_primary_key_column() {
        let bad = TableSchema::new([("n", ColumnType::Integer)], "id");
        assert!(bad.validate().is_err());
        assert!(schema().validate().is_ok());
    }

    #[test]
    fn check_row_accepts_matching_types() {
        let s = schema();
        assert!(s.check_row("x", &row("x", 3)).is_ok());
    }

    #[test]
    fn check_row_rejects_unknown_column() {
        let s = schema();
        let mut r = row("x", 1);
        r.insert("ghost".to_string(), json!(1));
        assert!(s.check_row("x", &r).unwrap_err().contains("ghost"));
    }

    #[test]
    fn check_row_rejects_type_mismatch() {
        let s = schema();
        let mut r = row("x", 1);
        r.insert("n".to_string(), json!("not a number"));
        assert!(s.check_row("x", &r).is_err());
    }

    #[test]
    fn check_row_requires_pk_to_match_key() {
        let s = schema();
        assert!(s.check_row("y", &row("x", 1)).is_err());
        let mut r = row("x", 1);
        r.remove("id");
        assert!(s.check_row("x", &r).is_err());
    }

    #[test]
    fn null_allowed_except_primary_key() {
        let s = schema();
        let mut r = row("x", 1);
        r.insert("note".to_string(), serde_json::Value::Null);
        assert!(s.check_row("x", &r).is_ok());
        r.insert("id".to_string(), serde_json::Value::Null);
        assert!(s.check_row("x", &r).is_err());
    }

    // ---- Staged view ----

    #[test]
    fn reads_see_store_then_overlay() {
        let mut committed = HashMap::new();
        committed.insert(("t".to_string(), "a".to_string()), row("a", 1));
        let source = MapSource(committed);
        let mut view = StagedView::new(&source, "t".to_string());

        // Committed state visible before any staging.
        assert_eq!(view.get("a").unwrap(), Some(row("a", 1)));
        assert_eq!(view.get("b").unwrap(), None);

        // Staged writes shadow the store for the rest of the batch.
        view.set("a", row("a", 2));
        assert_eq!(view.get("a").unwrap(), Some(row("a", 2)));
        view.delete("a");
        assert_eq!(view.get("a").unwrap(), None);

        assert_eq!(view.ops().len(), 2);
    }

    #[test]
    fn snapshot_restore_discards_partial_event() {
        let source = MapSource(HashMap::new());
        let mut view = StagedView::new(&source, "t".to_string());
        view.set("a", row("a", 1));

        let snap = view.snapshot();
        view.set("b", row("b", 1));
        view.delete("a");
        assert_eq!(view.get("a").unwrap(), None);

        view.restore(snap);
        assert_eq!(view.ops().len(), 1);
        assert_eq!(view.get("a").unwrap(), Some(row("a", 1)));
        assert_eq!(view.get("b").unwrap(), None);
    }

    #[test]
    fn ops_keep_handler_order() {
        let source = MapSource(HashMap::new());
        let mut view = StagedView::new(&source, "t".to_string());
        view.set("a", row("a", 1));
        view.delete("b");
        view.set("a", row("a", 2));

        let ops = view.into_ops();
        assert_eq!(
            ops,
            vec![
                TableOp::Upsert {
                    key: "a".to_string(),
                    row: row("a", 1)
                },
                TableOp::Delete {
                    key: "b".to_string()
                },
                TableOp::Upsert {
                    key: "a".to_string(),
                    row: row("a", 2)
                },
            ]
        );
    }
}
