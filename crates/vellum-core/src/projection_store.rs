//! Projection state store: one SQLite database per projection.
//!
//! Each registered projection owns `<root>/projections/<name>.table`,
//! holding its schema, its tenant-scoped rows, and its checkpoint. The op
//! batch and the checkpoint advance commit in a single transaction, which
//! is what makes a delivered batch's effect exactly-once: a crash anywhere
//! else leaves state consistent with the stored checkpoint, and the worker
//! re-delivers from there.
//!
//! Rows are keyed `(tenant_id, pk)`; every call takes the tenant as an
//! argument, so cross-tenant access simply cannot be expressed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::projection::{Row, RowSource, TableOp, TableSchema};

/// Manages the projection databases under `<root>/projections`.
#[derive(Debug)]
pub(crate) struct ProjectionStateStore {
    dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<ProjectionTable>>>,
}

impl ProjectionStateStore {
    /// Create the projections directory and an empty registry.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("projections");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Register a projection table, creating its database on first sight.
    /// Re-registering with a different schema is an error.
    pub fn register(&self, name: &str, schema: &TableSchema) -> Result<Arc<ProjectionTable>> {
        schema.validate()?;
        if let Some(existing) = self.get(name) {
            if existing.schema == *schema {
                return Ok(existing);
            }
            return Err(StoreError::SchemaMismatch {
                projection: name.to_string(),
            });
        }

        let table = Arc::new(ProjectionTable::open(&self.dir, name, schema)?);
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&table));
        info!(projection = name, "projection table registered");
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProjectionTable>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<ProjectionTable>> {
        self.get(name).ok_or_else(|| StoreError::ProjectionNotFound {
            projection: name.to_string(),
        })
    }
}

/// One projection's database handle.
#[derive(Debug)]
pub(crate) struct ProjectionTable {
    name: String,
    schema: TableSchema,
    conn: Mutex<Connection>,
}

impl ProjectionTable {
    fn open(dir: &Path, name: &str, schema: &TableSchema) -> Result<Self> {
        let path = dir.join(format!("{name}.table"));
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS rows (
                 tenant_id TEXT NOT NULL,
                 pk        TEXT NOT NULL,
                 data      TEXT NOT NULL,
                 PRIMARY KEY (tenant_id, pk)
             );",
        )?;

        // The schema is fixed at first registration; any later mismatch is
        // a caller error, not a migration.
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema', ?1)",
                    params![serde_json::to_string(schema)?],
                )?;
            }
            Some(stored) => {
                let stored_schema: TableSchema = serde_json::from_str(&stored)?;
                if stored_schema != *schema {
                    return Err(StoreError::SchemaMismatch {
                        projection: name.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            schema: schema.clone(),
            conn: Mutex::new(conn),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Atomically apply tenant-grouped ops and advance the checkpoint to
    /// `last_global_pos`, which must be strictly greater than the stored
    /// checkpoint. Partial commit is impossible: the transaction either
    /// lands whole or not at all.
    pub fn apply_batch(
        &self,
        ops_by_tenant: &[(String, Vec<TableOp>)],
        last_global_pos: u64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let current = read_checkpoint(&tx)?.unwrap_or(0);
        if last_global_pos <= current {
            return Err(StoreError::CheckpointRegression {
                projection: self.name.clone(),
                proposed: last_global_pos,
                current,
            });
        }

        for (tenant_id, ops) in ops_by_tenant {
            for op in ops {
                match op {
                    TableOp::Upsert { key, row } => {
                        self.schema.check_row(key, row).map_err(|reason| {
                            StoreError::RowSchemaViolation {
                                projection: self.name.clone(),
                                reason,
                            }
                        })?;
                        tx.execute(
                            "INSERT INTO rows (tenant_id, pk, data) VALUES (?1, ?2, ?3)
                             ON CONFLICT (tenant_id, pk) DO UPDATE SET data = excluded.data",
                            params![tenant_id, key, serde_json::to_string(row)?],
                        )?;
                    }
                    TableOp::Delete { key } => {
                        tx.execute(
                            "DELETE FROM rows WHERE tenant_id = ?1 AND pk = ?2",
                            params![tenant_id, key],
                        )?;
                    }
                }
            }
        }

        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('checkpoint', ?1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![last_global_pos.to_string()],
        )?;
        tx.commit()?;

        debug!(
            projection = %self.name,
            checkpoint = last_global_pos,
            "projection batch committed"
        );
        Ok(())
    }

    /// Read one row under the tenant scope.
    pub fn read_row(&self, tenant_id: &str, key: &str) -> Result<Option<Row>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM rows WHERE tenant_id = ?1 AND pk = ?2",
                params![tenant_id, key],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            None => Ok(None),
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        }
    }

    /// Highest applied global position, `None` before the first commit.
    pub fn checkpoint(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        read_checkpoint(&conn)
    }

    /// Remove every row a tenant owns. Not atomic with the log; intended
    /// for data-subject-erasure requests.
    pub fn delete_tenant(&self, tenant_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let deleted = conn.execute(
            "DELETE FROM rows WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        info!(
            projection = %self.name,
            tenant = tenant_id,
            deleted,
            "tenant rows erased from projection"
        );
        Ok(deleted)
    }
}

impl RowSource for ProjectionTable {
    fn read_row(&self, tenant_id: &str, key: &str) -> Result<Option<Row>> {
        Self::read_row(self, tenant_id, key)
    }
}

fn read_checkpoint(conn: &Connection) -> Result<Option<u64>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'checkpoint'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| StoreError::InvalidConfig(format!("corrupt checkpoint value {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{ColumnType, TableSchema};
    use serde_json::json;
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        TableSchema::new(
            [("id", ColumnType::Text), ("n", ColumnType::Integer)],
            "id",
        )
    }

    fn row(id: &str, n: i64) -> Row {
        Row::from([
            ("id".to_string(), json!(id)),
            ("n".to_string(), json!(n)),
        ])
    }

    fn upsert(key: &str, n: i64) -> TableOp {
        TableOp::Upsert {
            key: key.to_string(),
            row: row(key, n),
        }
    }

    // ---- Registration ----

    #[test]
    fn register_creates_table_file() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        store.register("counts", &schema()).unwrap();
        assert!(dir.path().join("projections/counts.table").exists());
    }

    #[test]
    fn reregister_same_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        store.register("counts", &schema()).unwrap();
        assert!(store.register("counts", &schema()).is_ok());
    }

    #[test]
    fn reregister_different_schema_fails() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        store.register("counts", &schema()).unwrap();

        let other = TableSchema::new([("id", ColumnType::Text)], "id");
        let err = store.register("counts", &other).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn schema_mismatch_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = ProjectionStateStore::open(dir.path()).unwrap();
            store.register("counts", &schema()).unwrap();
        }
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let other = TableSchema::new([("id", ColumnType::Text)], "id");
        let err = store.register("counts", &other).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    // ---- Apply + checkpoint ----

    #[test]
    fn apply_batch_advances_checkpoint_atomically() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();

        assert_eq!(table.checkpoint().unwrap(), None);
        table
            .apply_batch(&[("t1".to_string(), vec![upsert("x", 1)])], 10)
            .unwrap();

        assert_eq!(table.checkpoint().unwrap(), Some(10));
        assert_eq!(table.read_row("t1", "x").unwrap(), Some(row("x", 1)));
    }

    #[test]
    fn checkpoint_must_move_strictly_forward() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();
        table
            .apply_batch(&[("t1".to_string(), vec![upsert("x", 1)])], 10)
            .unwrap();

        // Equal: rejected (a replayed batch must not double-apply).
        let err = table
            .apply_batch(&[("t1".to_string(), vec![upsert("x", 2)])], 10)
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { proposed: 10, current: 10, .. }));

        // Lesser: rejected.
        let err = table
            .apply_batch(&[("t1".to_string(), vec![upsert("x", 2)])], 5)
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { .. }));

        // State untouched by the rejected batches.
        assert_eq!(table.read_row("t1", "x").unwrap(), Some(row("x", 1)));
    }

    #[test]
    fn rejected_row_rolls_back_whole_batch() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();

        let mut bad_row = row("y", 1);
        bad_row.insert("ghost".to_string(), json!(1));
        let err = table
            .apply_batch(
                &[(
                    "t1".to_string(),
                    vec![
                        upsert("x", 1),
                        TableOp::Upsert {
                            key: "y".to_string(),
                            row: bad_row,
                        },
                    ],
                )],
                7,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::RowSchemaViolation { .. }));

        // Neither the good op nor the checkpoint landed.
        assert_eq!(table.read_row("t1", "x").unwrap(), None);
        assert_eq!(table.checkpoint().unwrap(), None);
    }

    #[test]
    fn empty_ops_still_advance_checkpoint() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();

        table.apply_batch(&[], 42).unwrap();
        assert_eq!(table.checkpoint().unwrap(), Some(42));
    }

    #[test]
    fn upsert_then_delete_within_one_batch() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();

        table
            .apply_batch(
                &[(
                    "t1".to_string(),
                    vec![
                        upsert("x", 1),
                        TableOp::Delete {
                            key: "x".to_string(),
                        },
                    ],
                )],
                3,
            )
            .unwrap();
        assert_eq!(table.read_row("t1", "x").unwrap(), None);
    }

    // ---- Tenant isolation ----

    #[test]
    fn tenants_share_keys_without_collision() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();

        table
            .apply_batch(
                &[
                    ("t1".to_string(), vec![upsert("x", 1)]),
                    ("t2".to_string(), vec![upsert("x", 2)]),
                ],
                2,
            )
            .unwrap();

        assert_eq!(table.read_row("t1", "x").unwrap(), Some(row("x", 1)));
        assert_eq!(table.read_row("t2", "x").unwrap(), Some(row("x", 2)));
        assert_eq!(table.read_row("t3", "x").unwrap(), None);
    }

    #[test]
    fn delete_tenant_erases_only_that_tenant() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();
        table
            .apply_batch(
                &[
                    ("t1".to_string(), vec![upsert("x", 1), upsert("y", 2)]),
                    ("t2".to_string(), vec![upsert("x", 3)]),
                ],
                3,
            )
            .unwrap();

        assert_eq!(table.delete_tenant("t1").unwrap(), 2);
        assert_eq!(table.read_row("t1", "x").unwrap(), None);
        assert_eq!(table.read_row("t1", "y").unwrap(), None);
        assert_eq!(table.read_row("t2", "x").unwrap(), Some(row("x", 3)));
        // The checkpoint is untouched by erasure.
        assert_eq!(table.checkpoint().unwrap(), Some(3));
    }

    // ---- Persistence ----

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = ProjectionStateStore::open(dir.path()).unwrap();
            let table = store.register("counts", &schema()).unwrap();
            table
                .apply_batch(&[("t1".to_string(), vec![upsert("x", 9)])], 12)
                .unwrap();
        }
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let table = store.register("counts", &schema()).unwrap();
        assert_eq!(table.checkpoint().unwrap(), Some(12));
        assert_eq!(table.read_row("t1", "x").unwrap(), Some(row("x", 9)));
    }

    #[test]
    fn unknown_projection_is_an_error() {
        let dir = tempdir().unwrap();
        let store = ProjectionStateStore::open(dir.path()).unwrap();
        let err = store.require("nope").unwrap_err();
        assert!(matches!(err, StoreError::ProjectionNotFound { .. }));
    }
}
