//! SQLite-based state store for the executor.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Version of the on-disk layout.
pub const FORMAT_VERSION: i64 = 1;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state written by implementation {found}, expected {expected}")]
    IdentityMismatch { expected: String, found: String },

    #[error("state format version {found}, expected {expected}")]
    FormatMismatch { expected: i64, found: i64 },

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Hash identifying this build of the executor.
pub fn implementation_identity() -> String {
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_NAME").as_bytes());
    hasher.update(b":");
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Instance lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    /// Startup code is running.
    Loading,
    /// Instance is active.
    Running,
    /// Instance is tearing down.
    Stopping,
}

impl InstancePhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(Self::Loading),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }
}

/// Instance row in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstance {
    pub instance_id: String,
    /// `group/name` of the specification.
    pub spec_key: String,
    pub instance_number: Option<i64>,
    pub phase: InstancePhase,
    pub spec_hash: String,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
    /// Updated timestamp (Unix seconds).
    pub updated_at: i64,
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        Self::open_as(path, &implementation_identity(), FORMAT_VERSION)
    }

    /// Open a store on behalf of an explicit identity and format.
    pub(crate) fn open_as<P: AsRef<Path>>(
        path: P,
        identity: &str,
        format_version: i64,
    ) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        store.check_identity(identity, format_version)?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        store.check_identity(&implementation_identity(), FORMAT_VERSION)?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                implementation TEXT NOT NULL,
                format_version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                spec_key TEXT NOT NULL,
                instance_number INTEGER,
                phase TEXT NOT NULL,
                spec_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_spec ON instances(spec_key);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Stamp a fresh store, or verify the stamp of an existing one.
    fn check_identity(&self, identity: &str, format_version: i64) -> Result<(), StateStoreError> {
        let existing: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT implementation, format_version FROM meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO meta (id, implementation, format_version) VALUES (1, ?1, ?2)",
                    params![identity, format_version],
                )?;
                Ok(())
            }
            Some((found, _)) if found != identity => Err(StateStoreError::IdentityMismatch {
                expected: identity.to_string(),
                found,
            }),
            Some((_, found)) if found != format_version => Err(StateStoreError::FormatMismatch {
                expected: format_version,
                found,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Get an instance record.
    pub fn get_instance(&self, instance_id: &str) -> Result<Option<StoredInstance>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, spec_key, instance_number, phase, spec_hash, created_at, updated_at
             FROM instances WHERE instance_id = ?1",
        )?;

        let row = stmt
            .query_row(params![instance_id], Self::raw_row)
            .optional()?;
        row.map(Self::from_raw).transpose()
    }

    /// Insert or update an instance record.
    pub fn upsert_instance(&self, record: &StoredInstance) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO instances (instance_id, spec_key, instance_number, phase, spec_hash, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(instance_id) DO UPDATE SET
                spec_key = excluded.spec_key,
                instance_number = excluded.instance_number,
                phase = excluded.phase,
                spec_hash = excluded.spec_hash,
                updated_at = excluded.updated_at
            "#,
            params![
                record.instance_id,
                record.spec_key,
                record.instance_number,
                record.phase.as_str(),
                record.spec_hash,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Update instance phase.
    pub fn set_instance_phase(
        &self,
        instance_id: &str,
        phase: InstancePhase,
    ) -> Result<(), StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "UPDATE instances SET phase = ?1, updated_at = ?2 WHERE instance_id = ?3",
            params![phase.as_str(), now, instance_id],
        )?;
        Ok(())
    }

    /// Delete an instance record.
    pub fn delete_instance(&self, instance_id: &str) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    /// List all instances.
    pub fn list_instances(&self) -> Result<Vec<StoredInstance>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT instance_id, spec_key, instance_number, phase, spec_hash, created_at, updated_at
             FROM instances ORDER BY created_at",
        )?;

        let rows = stmt
            .query_map([], Self::raw_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::from_raw).collect()
    }

    /// Remove every instance row; returns how many were removed.
    pub fn clear_instances(&self) -> Result<usize, StateStoreError> {
        Ok(self.conn.execute("DELETE FROM instances", [])?)
    }

    fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(StoredInstance, String)> {
        let phase: String = row.get(3)?;
        Ok((
            StoredInstance {
                instance_id: row.get(0)?,
                spec_key: row.get(1)?,
                instance_number: row.get(2)?,
                phase: InstancePhase::Loading,
                spec_hash: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            },
            phase,
        ))
    }

    fn from_raw((mut record, phase): (StoredInstance, String)) -> Result<StoredInstance, StateStoreError> {
        record.phase = InstancePhase::parse(&phase)
            .ok_or_else(|| StateStoreError::Invalid(format!("unknown phase {phase}")))?;
        Ok(record)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> StoredInstance {
        StoredInstance {
            instance_id: id.to_string(),
            spec_key: "batch/worker".to_string(),
            instance_number: Some(1),
            phase: InstancePhase::Loading,
            spec_hash: "sha256:abc".to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn test_state_store_instances() {
        let store = StateStore::open_in_memory().unwrap();

        // Insert
        store.upsert_instance(&record("inst-1")).unwrap();

        // Get
        let fetched = store.get_instance("inst-1").unwrap().unwrap();
        assert_eq!(fetched.spec_key, "batch/worker");
        assert_eq!(fetched.phase, InstancePhase::Loading);

        // Update phase
        store
            .set_instance_phase("inst-1", InstancePhase::Running)
            .unwrap();
        let fetched = store.get_instance("inst-1").unwrap().unwrap();
        assert_eq!(fetched.phase, InstancePhase::Running);

        // List
        store.upsert_instance(&record("inst-2")).unwrap();
        assert_eq!(store.list_instances().unwrap().len(), 2);

        // Delete
        store.delete_instance("inst-1").unwrap();
        assert!(store.get_instance("inst-1").unwrap().is_none());
        assert_eq!(store.clear_instances().unwrap(), 1);
    }

    #[test]
    fn test_reopen_with_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.db");

        {
            let store = StateStore::open(&path).unwrap();
            store.upsert_instance(&record("inst-1")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn test_identity_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.db");

        drop(StateStore::open_as(&path, "someone-else", FORMAT_VERSION).unwrap());

        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(err, StateStoreError::IdentityMismatch { .. }));
    }

    #[test]
    fn test_format_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.db");

        drop(StateStore::open_as(&path, &implementation_identity(), FORMAT_VERSION + 1).unwrap());

        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::FormatMismatch {
                expected: FORMAT_VERSION,
                ..
            }
        ));
    }

    #[test]
    fn test_identity_is_stable() {
        assert_eq!(implementation_identity(), implementation_identity());
        assert_eq!(implementation_identity().len(), 32);
    }
}
