// =============================================================================
// Order Task Store — durable record of order-execution tasks
// =============================================================================
//
// Backs the executor's bounded in-memory queue. Every state transition is
// written through; dead-letter tasks live here forever and stay visible
// via `get` even after the executor drops them from memory. The secondary
// index on (idempotency_key, created_at) supports the dedup window probe.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::OrderOperation;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS order_tasks (
    task_id         TEXT PRIMARY KEY,
    operation       TEXT NOT NULL,
    params          TEXT NOT NULL,
    account_id      TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    result          TEXT,
    next_attempt_at TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_tasks_idempotency
    ON order_tasks(idempotency_key, created_at);

CREATE INDEX IF NOT EXISTS idx_order_tasks_status
    ON order_tasks(status, next_attempt_at);
"#;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One order-execution task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTask {
    pub task_id: Uuid,
    pub operation: OrderOperation,
    pub params: serde_json::Value,
    pub account_id: String,
    pub idempotency_key: String,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OrderTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl OrderTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply order task schema")?;
        info!(path = %path.as_ref().display(), "order task store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock()
            .execute_batch(SCHEMA_SQL)
            .context("failed to apply order task schema")?;
        Ok(Self { conn })
    }

    /// Write a task through, inserting or replacing the full row.
    pub fn persist(&self, task: &OrderTask) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO order_tasks
                     (task_id, operation, params, account_id, idempotency_key, status,
                      attempt_count, last_error, result, next_attempt_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(task_id) DO UPDATE SET
                     status = excluded.status,
                     attempt_count = excluded.attempt_count,
                     last_error = excluded.last_error,
                     result = excluded.result,
                     next_attempt_at = excluded.next_attempt_at,
                     updated_at = excluded.updated_at",
                params![
                    task.task_id.to_string(),
                    task.operation.to_string(),
                    task.params.to_string(),
                    task.account_id,
                    task.idempotency_key,
                    task.status.to_string(),
                    task.attempt_count,
                    task.last_error,
                    task.result.as_ref().map(|r| r.to_string()),
                    task.next_attempt_at.map(|t| t.to_rfc3339()),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to persist order task")?;
        Ok(())
    }

    pub fn get(&self, task_id: Uuid) -> Result<Option<OrderTask>> {
        self.conn
            .lock()
            .query_row(
                "SELECT task_id, operation, params, account_id, idempotency_key, status,
                        attempt_count, last_error, result, next_attempt_at, created_at, updated_at
                 FROM order_tasks WHERE task_id = ?1",
                params![task_id.to_string()],
                row_to_task,
            )
            .optional()
            .context("failed to fetch order task")
    }

    /// Most recent task under `key` created at or after `window_start`.
    pub fn find_in_window(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<OrderTask>> {
        self.conn
            .lock()
            .query_row(
                "SELECT task_id, operation, params, account_id, idempotency_key, status,
                        attempt_count, last_error, result, next_attempt_at, created_at, updated_at
                 FROM order_tasks
                 WHERE idempotency_key = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![key, window_start.to_rfc3339()],
                row_to_task,
            )
            .optional()
            .context("failed to probe idempotency window")
    }

    /// Dead-letter tasks, newest first.
    pub fn list_dead_letter(&self, limit: usize) -> Result<Vec<OrderTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, operation, params, account_id, idempotency_key, status,
                        attempt_count, last_error, result, next_attempt_at, created_at, updated_at
                 FROM order_tasks WHERE status = 'dead_letter'
                 ORDER BY updated_at DESC LIMIT ?1",
            )
            .context("failed to prepare dead-letter list")?;
        let mapped = stmt
            .query_map(params![limit as i64], row_to_task)
            .context("failed to query dead-letter tasks")?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row.context("failed to map order task row")?);
        }
        Ok(rows)
    }

    /// Pending and running tasks, used to repopulate the queue on startup.
    pub fn list_open(&self) -> Result<Vec<OrderTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, operation, params, account_id, idempotency_key, status,
                        attempt_count, last_error, result, next_attempt_at, created_at, updated_at
                 FROM order_tasks WHERE status IN ('pending', 'running', 'failed')
                 ORDER BY created_at",
            )
            .context("failed to prepare open-task list")?;
        let mapped = stmt
            .query_map([], row_to_task)
            .context("failed to query open tasks")?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row.context("failed to map order task row")?);
        }
        Ok(rows)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderTask> {
    let id: String = row.get(0)?;
    let operation: String = row.get(1)?;
    let params_json: String = row.get(2)?;
    let status: String = row.get(5)?;
    let result_json: Option<String> = row.get(8)?;
    let next_attempt: Option<String> = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;

    Ok(OrderTask {
        task_id: Uuid::parse_str(&id).unwrap_or_default(),
        operation: operation.parse().unwrap_or(crate::types::OrderOperation::Place),
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        account_id: row.get(3)?,
        idempotency_key: row.get(4)?,
        status: status.parse().unwrap_or(TaskStatus::Failed),
        attempt_count: row.get(6)?,
        last_error: row.get(7)?,
        result: result_json.and_then(|r| serde_json::from_str(&r).ok()),
        next_attempt_at: next_attempt.and_then(|t| {
            DateTime::parse_from_rfc3339(&t)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        created_at: parse_rfc3339(&created),
        updated_at: parse_rfc3339(&updated),
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl std::fmt::Debug for OrderTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderTaskStore").finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> OrderTaskStore {
        let conn = Connection::open_in_memory().unwrap();
        OrderTaskStore::with_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    fn task(key: &str) -> OrderTask {
        let now = Utc::now();
        OrderTask {
            task_id: Uuid::new_v4(),
            operation: OrderOperation::Place,
            params: serde_json::json!({"symbol": "NIFTY25NOVFUT", "side": "BUY", "qty": 50}),
            account_id: "primary".into(),
            idempotency_key: key.into(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
            next_attempt_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn persist_then_get_round_trips() {
        let s = store();
        let t = task("k1");
        s.persist(&t).unwrap();

        let back = s.get(t.task_id).unwrap().unwrap();
        assert_eq!(back.task_id, t.task_id);
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.params["symbol"], "NIFTY25NOVFUT");
    }

    #[test]
    fn persist_updates_in_place() {
        let s = store();
        let mut t = task("k1");
        s.persist(&t).unwrap();

        t.status = TaskStatus::DeadLetter;
        t.attempt_count = 5;
        t.last_error = Some("broker rejected".into());
        s.persist(&t).unwrap();

        let back = s.get(t.task_id).unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::DeadLetter);
        assert_eq!(back.attempt_count, 5);
        assert_eq!(back.last_error.as_deref(), Some("broker rejected"));
    }

    #[test]
    fn idempotency_probe_respects_the_window() {
        let s = store();
        let t = task("dup-key");
        s.persist(&t).unwrap();

        let hit = s
            .find_in_window("dup-key", Utc::now() - Duration::minutes(5))
            .unwrap();
        assert_eq!(hit.unwrap().task_id, t.task_id);

        // Outside the window: no match.
        let miss = s
            .find_in_window("dup-key", Utc::now() + Duration::minutes(1))
            .unwrap();
        assert!(miss.is_none());

        assert!(s
            .find_in_window("other-key", Utc::now() - Duration::minutes(5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn dead_letter_listing() {
        let s = store();
        let mut a = task("a");
        a.status = TaskStatus::DeadLetter;
        s.persist(&a).unwrap();
        let b = task("b");
        s.persist(&b).unwrap();

        let dlq = s.list_dead_letter(10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].task_id, a.task_id);
    }

    #[test]
    fn open_tasks_repopulate_in_creation_order() {
        let s = store();
        let mut completed = task("done");
        completed.status = TaskStatus::Completed;
        s.persist(&completed).unwrap();
        s.persist(&task("p1")).unwrap();
        s.persist(&task("p2")).unwrap();

        let open = s.list_open().unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|t| t.status == TaskStatus::Pending));
    }
}
