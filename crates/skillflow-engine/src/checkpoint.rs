use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use skillflow_core::config::{CheckpointBackendKind, CheckpointConfig};
use skillflow_core::error::{Result, SkillflowError};
use skillflow_core::state::GraphState;
use skillflow_core::traits::CheckpointBackend;
use skillflow_core::types::ExecutionId;

fn storage_err(context: &str, e: impl std::fmt::Display) -> SkillflowError {
    SkillflowError::Checkpoint(format!("{}: {}", context, e))
}

/// Checkpoint backend persisted in SQLite.
pub struct SqliteCheckpointBackend {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointBackend {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| storage_err("Failed to create checkpoint directory", e))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| storage_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 execution_id TEXT PRIMARY KEY,
                 schema_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 next_group_index INTEGER NOT NULL,
                 state_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_schema_status
                 ON checkpoints(schema_id, status);",
        )
        .map_err(|e| storage_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointBackend for SqliteCheckpointBackend {
    fn put(&self, state: &GraphState) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let mut conn = self.conn.lock().map_err(|e| storage_err("Lock poisoned", e))?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_err("Failed to begin transaction", e))?;

        // Keep only the latest snapshot per execution
        tx.execute(
            "DELETE FROM checkpoints WHERE execution_id = ?1",
            params![state.execution_id.as_str()],
        )
        .map_err(|e| storage_err("Failed to clean old checkpoint", e))?;

        tx.execute(
            "INSERT INTO checkpoints (execution_id, schema_id, status, next_group_index, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.execution_id.as_str(),
                state.schema_id,
                state.status.to_string(),
                state.next_group_index as i64,
                state_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| storage_err("Failed to save checkpoint", e))?;

        tx.commit()
            .map_err(|e| storage_err("Failed to commit checkpoint", e))?;
        Ok(())
    }

    fn get(&self, execution_id: &ExecutionId) -> Result<Option<GraphState>> {
        let conn = self.conn.lock().map_err(|e| storage_err("Lock poisoned", e))?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM checkpoints WHERE execution_id = ?1",
                params![execution_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("Failed to load checkpoint", e))?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, execution_id: &ExecutionId) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| storage_err("Lock poisoned", e))?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![execution_id.as_str()],
            )
            .map_err(|e| storage_err("Failed to delete checkpoint", e))?;
        Ok(deleted > 0)
    }
}

/// Checkpoint backend kept in process memory.
#[derive(Default)]
pub struct MemoryCheckpointBackend {
    states: RwLock<HashMap<String, GraphState>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointBackend for MemoryCheckpointBackend {
    fn put(&self, state: &GraphState) -> Result<()> {
        let mut states = self
            .states
            .write()
            .map_err(|e| storage_err("Lock poisoned", e))?;
        states.insert(state.execution_id.0.clone(), state.clone());
        Ok(())
    }

    fn get(&self, execution_id: &ExecutionId) -> Result<Option<GraphState>> {
        let states = self
            .states
            .read()
            .map_err(|e| storage_err("Lock poisoned", e))?;
        Ok(states.get(execution_id.as_str()).cloned())
    }

    fn delete(&self, execution_id: &ExecutionId) -> Result<bool> {
        let mut states = self
            .states
            .write()
            .map_err(|e| storage_err("Lock poisoned", e))?;
        Ok(states.remove(execution_id.as_str()).is_some())
    }
}

type LeaseTable = Arc<Mutex<HashSet<String>>>;

/// Exclusive right to write checkpoints for one execution.
///
/// Released when dropped.
#[derive(Debug)]
pub struct ExecutionLease {
    execution_id: ExecutionId,
    table: LeaseTable,
}

impl ExecutionLease {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.table.lock() {
            held.remove(self.execution_id.as_str());
            debug!(execution_id = %self.execution_id, "Lease released");
        }
    }
}

/// Checkpoint store: a backend plus per-execution single-writer leases.
///
/// Leases are held in this process only; two processes sharing one
/// SQLite file do not see each other's leases.
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    leases: LeaseTable,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointBackend::new()))
    }

    pub fn sqlite(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteCheckpointBackend::open(path)?)))
    }

    /// Build the backend selected by `[checkpoint]` settings.
    pub fn from_config(config: &CheckpointConfig, path: &Path) -> Result<Self> {
        match config.backend {
            CheckpointBackendKind::Memory => Ok(Self::in_memory()),
            CheckpointBackendKind::Sqlite => Self::sqlite(path),
        }
    }

    /// Take the write lease for `execution_id`, or fail with `ExecutionBusy`.
    pub fn acquire(&self, execution_id: &ExecutionId) -> Result<ExecutionLease> {
        let mut held = self
            .leases
            .lock()
            .map_err(|e| storage_err("Lock poisoned", e))?;
        if !held.insert(execution_id.0.clone()) {
            return Err(SkillflowError::ExecutionBusy(execution_id.0.clone()));
        }
        debug!(execution_id = %execution_id, "Lease acquired");
        Ok(ExecutionLease {
            execution_id: execution_id.clone(),
            table: Arc::clone(&self.leases),
        })
    }

    pub fn is_leased(&self, execution_id: &ExecutionId) -> bool {
        self.leases
            .lock()
            .map(|held| held.contains(execution_id.as_str()))
            .unwrap_or(false)
    }

    /// Persist a snapshot. Only the lease holder may write.
    pub fn save(&self, lease: &ExecutionLease, state: &GraphState) -> Result<()> {
        if lease.execution_id != state.execution_id {
            return Err(SkillflowError::Checkpoint(format!(
                "lease for {} cannot write {}",
                lease.execution_id, state.execution_id
            )));
        }
        self.backend.put(state).map_err(|e| {
            error!(execution_id = %state.execution_id, error = %e, "Checkpoint write failed");
            e
        })
    }

    /// Load the latest snapshot or fail with `ExecutionNotFound`.
    pub fn load(&self, execution_id: &ExecutionId) -> Result<GraphState> {
        self.backend
            .get(execution_id)?
            .ok_or_else(|| SkillflowError::ExecutionNotFound(execution_id.0.clone()))
    }

    /// Remove a snapshot. The engine itself never calls this.
    pub fn delete(&self, execution_id: &ExecutionId) -> Result<bool> {
        self.backend.delete(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillflow_core::state::WorkflowStatus;

    fn temp_backend() -> (tempfile::TempDir, SqliteCheckpointBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteCheckpointBackend::open(&dir.path().join("checkpoints.db")).unwrap();
        (dir, backend)
    }

    fn state(id: &str) -> GraphState {
        GraphState::new(ExecutionId::from_str(id), "doc", "invoice", "1")
    }

    #[test]
    fn test_sqlite_put_and_get() {
        let (_dir, backend) = temp_backend();
        let mut st = state("exec-1");
        st.next_group_index = 2;
        backend.put(&st).unwrap();

        let loaded = backend.get(&st.execution_id).unwrap().unwrap();
        assert_eq!(loaded, st);
    }

    #[test]
    fn test_sqlite_put_overwrites() {
        let (_dir, backend) = temp_backend();
        let mut st = state("exec-1");
        backend.put(&st).unwrap();
        st.next_group_index = 1;
        st.status = WorkflowStatus::AwaitingHumanReview;
        backend.put(&st).unwrap();

        let loaded = backend.get(&st.execution_id).unwrap().unwrap();
        assert_eq!(loaded.next_group_index, 1);
        assert_eq!(loaded.status, WorkflowStatus::AwaitingHumanReview);
    }

    #[test]
    fn test_sqlite_delete_and_missing() {
        let (_dir, backend) = temp_backend();
        let st = state("exec-del");
        backend.put(&st).unwrap();
        assert!(backend.delete(&st.execution_id).unwrap());
        assert!(!backend.delete(&st.execution_id).unwrap());
        assert!(backend.get(&st.execution_id).unwrap().is_none());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        let st = state("exec-persist");
        {
            let backend = SqliteCheckpointBackend::open(&path).unwrap();
            backend.put(&st).unwrap();
        }
        let backend = SqliteCheckpointBackend::open(&path).unwrap();
        assert_eq!(backend.get(&st.execution_id).unwrap().unwrap(), st);
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryCheckpointBackend::new();
        let st = state("exec-mem");
        assert!(backend.get(&st.execution_id).unwrap().is_none());
        backend.put(&st).unwrap();
        assert!(backend.get(&st.execution_id).unwrap().is_some());
        assert!(backend.delete(&st.execution_id).unwrap());
    }

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let store = CheckpointStore::in_memory();
        let id = ExecutionId::from_str("exec-lease");

        let lease = store.acquire(&id).unwrap();
        assert!(store.is_leased(&id));
        assert!(matches!(store.acquire(&id), Err(SkillflowError::ExecutionBusy(_))));

        // Other executions are independent.
        let other = store.acquire(&ExecutionId::from_str("exec-other")).unwrap();
        drop(other);

        drop(lease);
        assert!(!store.is_leased(&id));
        assert!(store.acquire(&id).is_ok());
    }

    #[test]
    fn test_save_requires_matching_lease() {
        let store = CheckpointStore::in_memory();
        let lease = store.acquire(&ExecutionId::from_str("a")).unwrap();
        let err = store.save(&lease, &state("b")).unwrap_err();
        assert!(matches!(err, SkillflowError::Checkpoint(_)));

        store.save(&lease, &state("a")).unwrap();
        assert_eq!(store.load(&ExecutionId::from_str("a")).unwrap().schema_id, "invoice");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let store = CheckpointStore::in_memory();
        assert!(matches!(
            store.load(&ExecutionId::from_str("nope")),
            Err(SkillflowError::ExecutionNotFound(_))
        ));
    }
}
