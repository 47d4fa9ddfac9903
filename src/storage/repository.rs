//! Repository Pattern for node persistence
//!
//! Node records are the only durable state of the controller: disks and
//! templates are re-derived from the filesystem at startup. This module
//! decouples the lifecycle manager from the storage implementation:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            NodeLifecycleManager             │
//! └─────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────┐
//! │              NodeRepository                 │
//! └─────────────────────────────────────────────┘
//!             │                      │
//!             ▼                      ▼
//! ┌──────────────────────┐ ┌──────────────────────┐
//! │        SQLite        │ │         Mock         │
//! │    Implementation    │ │    Implementation    │
//! └──────────────────────┘ └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bakery::storage::repository::{NodeRepository, SqliteNodeRepository};
//!
//! let repo = SqliteNodeRepository::new("data/nodes.db")?;
//! let mock_repo = MockNodeRepository::new();
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{Node, NodeStatus};

// ============================================================================
// Repository Trait
// ============================================================================

/// Durable storage for node records
pub trait NodeRepository: Send + Sync {
    /// Insert the node or overwrite the existing row with the same id.
    ///
    /// Implementations must perform this as one atomic write.
    fn upsert(&self, node: &Node) -> Result<()>;

    /// Get a node by id
    fn get(&self, id: &str) -> Result<Option<Node>>;

    /// List nodes with the given status, ordered by id
    fn list_by_status(&self, status: NodeStatus) -> Result<Vec<Node>>;

    /// List every node, ordered by id
    fn list_all(&self) -> Result<Vec<Node>>;

    /// List provisioning and ready nodes, ordered by id
    fn list_active(&self) -> Result<Vec<Node>> {
        let mut nodes = self.list_by_status(NodeStatus::Provisioning)?;
        nodes.extend(self.list_by_status(NodeStatus::Ready)?);
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

/// Join disk ids for the `disk_ids` column
fn join_disk_ids(disks: &[String]) -> String {
    disks.join(",")
}

/// Split the `disk_ids` column, skipping empty entries
fn split_disk_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of NodeRepository
///
/// One connection behind a `Mutex`; callers never hold it across an await.
pub struct SqliteNodeRepository {
    conn: Mutex<Connection>,
}

impl SqliteNodeRepository {
    /// Open (or create) the node database at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL keeps `bakery nodes` readable while the server writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite node repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::persistence("node database connection lock poisoned"))
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    id TEXT PRIMARY KEY NOT NULL,
                    status INTEGER NOT NULL,
                    template TEXT NOT NULL DEFAULT '',
                    disk_ids TEXT NOT NULL DEFAULT '',
                    bake_id TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_nodes_status
                    ON nodes(status);
                "#,
        )?;

        Ok(())
    }

    fn row_to_node(row: &Row<'_>) -> rusqlite::Result<(Node, i64)> {
        let status_code: i64 = row.get(1)?;
        let template: String = row.get(2)?;
        let disk_ids: String = row.get(3)?;
        let updated_at: String = row.get(5)?;

        let node = Node {
            id: row.get(0)?,
            status: NodeStatus::from_code(status_code).unwrap_or_default(),
            template: (!template.is_empty()).then_some(template),
            disks: split_disk_ids(&disk_ids),
            bake_id: row.get(4)?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        };

        Ok((node, status_code))
    }

    fn query_nodes(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;

        let mut nodes = Vec::new();
        for row in stmt.query_map(args, Self::row_to_node)? {
            let (node, code) = row?;
            if NodeStatus::from_code(code).is_none() {
                return Err(Error::persistence(format!(
                    "node {} has unknown status code {code}",
                    node.id
                )));
            }
            nodes.push(node);
        }

        Ok(nodes)
    }
}

impl NodeRepository for SqliteNodeRepository {
    fn upsert(&self, node: &Node) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
                INSERT INTO nodes (id, status, template, disk_ids, bake_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    template = excluded.template,
                    disk_ids = excluded.disk_ids,
                    bake_id = excluded.bake_id,
                    updated_at = excluded.updated_at
                "#,
            params![
                node.id,
                node.status.code(),
                node.template.as_deref().unwrap_or(""),
                join_disk_ids(&node.disks),
                node.bake_id,
                node.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, status, template, disk_ids, bake_id, updated_at
                 FROM nodes WHERE id = ?1",
                params![id],
                Self::row_to_node,
            )
            .optional()?;

        match row {
            Some((node, code)) if NodeStatus::from_code(code).is_none() => Err(
                Error::persistence(format!("node {} has unknown status code {code}", node.id)),
            ),
            Some((node, _)) => Ok(Some(node)),
            None => Ok(None),
        }
    }

    fn list_by_status(&self, status: NodeStatus) -> Result<Vec<Node>> {
        let code = status.code();
        self.query_nodes(
            "SELECT id, status, template, disk_ids, bake_id, updated_at
             FROM nodes WHERE status = ?1 ORDER BY id",
            &[&code as &dyn rusqlite::ToSql],
        )
    }

    fn list_all(&self) -> Result<Vec<Node>> {
        self.query_nodes(
            "SELECT id, status, template, disk_ids, bake_id, updated_at
             FROM nodes ORDER BY id",
            &[],
        )
    }
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

/// In-memory mock implementation of NodeRepository
///
/// Useful for testing without database dependencies. Writes can be made to
/// fail to exercise persistence error paths.
pub struct MockNodeRepository {
    nodes: RwLock<HashMap<String, Node>>,
    fail_writes: AtomicBool,
}

impl MockNodeRepository {
    /// Create a new mock repository
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent upsert fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Node>>> {
        self.nodes
            .read()
            .map_err(|_| Error::persistence("mock repository lock poisoned"))
    }
}

impl Default for MockNodeRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRepository for MockNodeRepository {
    fn upsert(&self, node: &Node) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::persistence("injected write failure"));
        }

        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| Error::persistence("mock repository lock poisoned"))?;
        nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn list_by_status(&self, status: NodeStatus) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .read()?
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    fn list_all(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.read()?.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

// ============================================================================
// Shared Repository Types
// ============================================================================

/// Thread-safe shared repository wrapper
pub type SharedNodeRepository = Arc<dyn NodeRepository>;

/// Create a shared SQLite repository
pub fn create_sqlite_repository(path: impl AsRef<Path>) -> Result<SharedNodeRepository> {
    let repo = SqliteNodeRepository::new(path)?;
    Ok(Arc::new(repo))
}

/// Create a shared mock repository
pub fn create_mock_repository() -> SharedNodeRepository {
    Arc::new(MockNodeRepository::new())
}

// ============================================================================
// Tests
// ============================================================================
