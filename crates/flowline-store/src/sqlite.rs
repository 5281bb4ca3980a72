use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowline_core::error::{FlowError, Result};
use flowline_core::run::{RunId, RunStatus, WorkflowRun};
use flowline_core::traits::{DefinitionStore, RunStore};
use flowline_core::workflow::WorkflowDefinition;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_workflow
        ON runs(workflow_id, status, created_at);

    CREATE INDEX IF NOT EXISTS idx_runs_status
        ON runs(status, created_at);

    CREATE TABLE IF NOT EXISTS definitions (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        body TEXT NOT NULL
    );";

/// SQLite-backed run and definition store.
///
/// Runs and definitions are stored as JSON bodies; the columns next to them
/// exist only for filtering and ordering.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_runs(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<WorkflowRun>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let bodies = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(FlowError::from))
            .collect()
    }
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&run)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO runs (id, workflow_id, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                params![
                    run.id.as_str(),
                    run.workflow_id,
                    run.status.as_str(),
                    run.created_at.to_rfc3339(),
                    body,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let body: Option<String> = conn
                .query_row("SELECT body FROM runs WHERE id = ?1", params![id.as_str()], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(FlowError::from))
                .transpose()
        })
    }

    fn list_runs(
        &self,
        workflow_id: &str,
        status: Option<RunStatus>,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            match status {
                Some(status) => self.query_runs(
                    "SELECT body FROM runs WHERE workflow_id = ?1 AND status = ?2
                     ORDER BY created_at, id",
                    params![workflow_id, status.as_str()],
                ),
                None => self.query_runs(
                    "SELECT body FROM runs WHERE workflow_id = ?1 ORDER BY created_at, id",
                    params![workflow_id],
                ),
            }
        })
    }

    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            self.query_runs(
                "SELECT body FROM runs WHERE status IN ('pending', 'running')
                 ORDER BY created_at, id",
                params![],
            )
        })
    }
}

impl DefinitionStore for SqliteStore {
    fn save_definition(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&def)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO definitions (id, status, version, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    def.id,
                    def.status.as_str(),
                    def.version as i64,
                    def.updated_at.to_rfc3339(),
                    body,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let body: Option<String> = conn
                .query_row("SELECT body FROM definitions WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(FlowError::from))
                .transpose()
        })
    }

    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT body FROM definitions ORDER BY id")
                .map_err(db_err)?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(FlowError::from))
                .collect()
        })
    }
}
