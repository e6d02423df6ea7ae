//! # SQLite Record Store
//!
//! Durable [`StateStore`] backed by a single SQLite database.
//!
//! ## Tables
//!
//! - `grouping_states`: one encoded grouping state per dataset
//! - `final_results`: saved final results per dataset, with their source state
//! - `named_plans`: one MessagePack plan blob per plan, with the id, name and
//!   creation time duplicated into columns for listing
//!
//! Plan ids are derived from an autoincrement sequence, so ids are never
//! reused after a delete.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::plan::{NamedPlan, PlanSummary};
use crate::store::{check_record_size, plan_id, StateStore};
use crate::{GroupingError, Result, StorageConfig};

pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
    max_record_bytes: usize,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at the given database path.
    pub fn new(db_path: &str) -> Result<Self> {
        Self::with_limit(db_path, StorageConfig::default().max_record_bytes)
    }

    /// Open a store with an explicit per-record ceiling.
    pub fn with_limit(db_path: &str, max_record_bytes: usize) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        log::info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
            max_record_bytes,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Latest grouping state per dataset
            CREATE TABLE IF NOT EXISTS grouping_states (
                dataset_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            -- Saved final results per dataset
            CREATE TABLE IF NOT EXISTS final_results (
                dataset_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            -- Saved label structures
            CREATE TABLE IF NOT EXISTS named_plans (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                data BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_named_plans_id ON named_plans(id);
        "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| GroupingError::Storage("connection lock poisoned".to_string()))
    }
}

fn decode_plan(blob: &[u8]) -> Result<NamedPlan> {
    Ok(rmp_serde::from_slice(blob)?)
}

impl StateStore for SqliteStore {
    fn put_state(&self, dataset_id: &str, bytes: &[u8]) -> Result<()> {
        check_record_size(bytes.len(), self.max_record_bytes)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO grouping_states (dataset_id, data, size, updated_at)
             VALUES (?, ?, ?, strftime('%s', 'now'))",
            params![dataset_id, bytes, bytes.len() as i64],
        )?;
        Ok(())
    }

    fn get_state(&self, dataset_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT data FROM grouping_states WHERE dataset_id = ?",
                params![dataset_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn delete_state(&self, dataset_id: &str) -> Result<bool> {
        let deleted = self.conn()?.execute(
            "DELETE FROM grouping_states WHERE dataset_id = ?",
            params![dataset_id],
        )?;
        Ok(deleted > 0)
    }

    fn put_final_results(&self, dataset_id: &str, bytes: &[u8]) -> Result<()> {
        check_record_size(bytes.len(), self.max_record_bytes)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO final_results (dataset_id, data, size, updated_at)
             VALUES (?, ?, ?, strftime('%s', 'now'))",
            params![dataset_id, bytes, bytes.len() as i64],
        )?;
        Ok(())
    }

    fn get_final_results(&self, dataset_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT data FROM final_results WHERE dataset_id = ?",
                params![dataset_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn delete_final_results(&self, dataset_id: &str) -> Result<bool> {
        let deleted = self.conn()?.execute(
            "DELETE FROM final_results WHERE dataset_id = ?",
            params![dataset_id],
        )?;
        Ok(deleted > 0)
    }

    fn insert_plan(&self, mut plan: NamedPlan) -> Result<NamedPlan> {
        let conn = self.conn()?;

        // Reserve the row first so the id comes from the sequence
        conn.execute(
            "INSERT INTO named_plans (name, created_at, data) VALUES (?, ?, x'')",
            params![plan.name, plan.created_at.to_rfc3339()],
        )?;
        let seq = conn.last_insert_rowid();
        plan.id = plan_id(seq as u64);

        let blob = rmp_serde::to_vec_named(&plan)?;
        if let Err(e) = check_record_size(blob.len(), self.max_record_bytes) {
            conn.execute("DELETE FROM named_plans WHERE seq = ?", params![seq])?;
            return Err(e);
        }
        conn.execute(
            "UPDATE named_plans SET id = ?, data = ? WHERE seq = ?",
            params![plan.id, blob, seq],
        )?;
        Ok(plan)
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<NamedPlan>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT data FROM named_plans WHERE id = ?",
                params![plan_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        blob.map(|b| decode_plan(&b)).transpose()
    }

    fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM named_plans WHERE id IS NOT NULL ORDER BY seq")?;
        let blobs = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        blobs
            .iter()
            .map(|b| decode_plan(b).map(|p| p.summary()))
            .collect()
    }

    fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM named_plans WHERE id = ?", params![plan_id])?;
        Ok(deleted > 0)
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenerationMethod, GroupingState};

    fn plan(name: &str) -> NamedPlan {
        let mut state = GroupingState::new("ds", 0, GenerationMethod::ConfiguredColumns);
        let gi = state.push_group("Office");
        state.push_sub_group(gi, "Paper");
        NamedPlan::from_state(&state, name, Some("weekly order")).unwrap()
    }

    #[test]
    fn test_state_upsert_and_delete() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_state("ds", b"first").unwrap();
        store.put_state("ds", b"second").unwrap();
        assert_eq!(store.get_state("ds").unwrap(), Some(b"second".to_vec()));
        assert!(store.delete_state("ds").unwrap());
        assert_eq!(store.get_state("ds").unwrap(), None);
    }

    #[test]
    fn test_state_limit() {
        let store = SqliteStore::with_limit(":memory:", 4).unwrap();
        let err = store.put_state("ds", b"too long").unwrap_err();
        assert!(matches!(err, GroupingError::CapacityExceeded { size: 8, limit: 4 }));
        assert_eq!(store.get_state("ds").unwrap(), None);
    }

    #[test]
    fn test_final_results_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grouper.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::new(path).unwrap();
            store.put_final_results("ds", b"v1").unwrap();
            store.put_final_results("ds", b"v2").unwrap();
        }
        let store = SqliteStore::new(path).unwrap();
        assert_eq!(store.get_final_results("ds").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get_state("ds").unwrap(), None);
        assert!(store.delete_final_results("ds").unwrap());
        assert!(!store.delete_final_results("ds").unwrap());
    }

    #[test]
    fn test_plan_ids_are_not_reused() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.insert_plan(plan("A")).unwrap();
        assert_eq!(a.id, "plan-1");
        assert!(store.delete_plan(&a.id).unwrap());
        let b = store.insert_plan(plan("B")).unwrap();
        assert_eq!(b.id, "plan-2");

        let stored = store.get_plan("plan-2").unwrap().unwrap();
        assert_eq!(stored, b);
        assert_eq!(stored.description, "weekly order");

        let summaries = store.list_plans().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].group_count, 1);
        assert_eq!(summaries[0].sub_group_count, 1);
    }

    #[test]
    fn test_oversized_plan_is_not_kept() {
        let store = SqliteStore::with_limit(":memory:", 16).unwrap();
        assert!(store.insert_plan(plan("Big")).is_err());
        assert!(store.list_plans().unwrap().is_empty());
    }
}
