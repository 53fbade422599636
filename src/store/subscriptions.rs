// =============================================================================
// Subscription Store — persistent per-instrument subscription intent
// =============================================================================
//
// One row per instrument token; at most one active subscription per token
// by construction (the token is the primary key). All filtering happens in
// SQL — callers never page through full tables in process. Writes serialize
// on the connection mutex; reads may trail a write by one.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::types::{Subscription, SubscriptionStatus, TickMode};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS subscriptions (
    instrument_token    INTEGER PRIMARY KEY,
    requested_mode      TEXT NOT NULL,
    status              TEXT NOT NULL,
    assigned_account_id TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_status
    ON subscriptions(status, instrument_token);
"#;

#[derive(Clone)]
pub struct SubscriptionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SubscriptionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply subscription schema")?;
        info!(path = %path.as_ref().display(), "subscription store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share an existing connection (the order-task store lives in the same
    /// database file).
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock()
            .execute_batch(SCHEMA_SQL)
            .context("failed to apply subscription schema")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Insert or reactivate a subscription. Returns `true` when the row was
    /// newly created.
    pub fn upsert(
        &self,
        instrument_token: u32,
        mode: TickMode,
        account_id: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM subscriptions WHERE instrument_token = ?1",
                params![instrument_token],
                |row| row.get(0),
            )
            .optional()
            .context("failed to probe subscription")?;

        conn.execute(
            "INSERT INTO subscriptions
                 (instrument_token, requested_mode, status, assigned_account_id, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?4)
             ON CONFLICT(instrument_token) DO UPDATE SET
                 requested_mode = excluded.requested_mode,
                 status = 'active',
                 assigned_account_id = COALESCE(excluded.assigned_account_id, subscriptions.assigned_account_id),
                 updated_at = excluded.updated_at",
            params![instrument_token, mode.wire_word(), account_id, now],
        )
        .context("failed to upsert subscription")?;

        debug!(token = instrument_token, mode = %mode, created = existing.is_none(), "subscription upserted");
        Ok(existing.is_none())
    }

    /// Mark a subscription inactive. Returns `true` if a row changed.
    pub fn deactivate(&self, instrument_token: u32) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE subscriptions
                 SET status = 'inactive', assigned_account_id = NULL, updated_at = ?2
                 WHERE instrument_token = ?1 AND status != 'inactive'",
                params![instrument_token, now],
            )
            .context("failed to deactivate subscription")?;
        Ok(changed > 0)
    }

    /// Deactivate a set of tokens in one transaction (registry pruning).
    pub fn deactivate_many(&self, tokens: &[u32]) -> Result<usize> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let mut changed = 0;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE subscriptions
                     SET status = 'inactive', assigned_account_id = NULL, updated_at = ?2
                     WHERE instrument_token = ?1 AND status != 'inactive'",
                )
                .context("failed to prepare deactivation")?;
            for token in tokens {
                changed += stmt
                    .execute(params![token, now])
                    .context("failed to deactivate token")?;
            }
        }
        tx.commit().context("failed to commit deactivations")?;
        Ok(changed)
    }

    /// Record which account the orchestrator assigned a token to.
    pub fn set_assignment(&self, instrument_token: u32, account_id: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .execute(
                "UPDATE subscriptions SET assigned_account_id = ?2, updated_at = ?3
                 WHERE instrument_token = ?1",
                params![instrument_token, account_id, now],
            )
            .context("failed to record assignment")?;
        Ok(())
    }

    /// List subscriptions with storage-side status filtering and pagination.
    pub fn list(
        &self,
        status: Option<SubscriptionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock();
        let mut rows = Vec::new();

        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT instrument_token, requested_mode, status, assigned_account_id,
                                created_at, updated_at
                         FROM subscriptions WHERE status = ?1
                         ORDER BY instrument_token LIMIT ?2 OFFSET ?3",
                    )
                    .context("failed to prepare filtered list")?;
                let mapped = stmt
                    .query_map(
                        params![status.to_string(), limit as i64, offset as i64],
                        row_to_subscription,
                    )
                    .context("failed to query subscriptions")?;
                for row in mapped {
                    rows.push(row.context("failed to map subscription row")?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT instrument_token, requested_mode, status, assigned_account_id,
                                created_at, updated_at
                         FROM subscriptions
                         ORDER BY instrument_token LIMIT ?1 OFFSET ?2",
                    )
                    .context("failed to prepare list")?;
                let mapped = stmt
                    .query_map(params![limit as i64, offset as i64], row_to_subscription)
                    .context("failed to query subscriptions")?;
                for row in mapped {
                    rows.push(row.context("failed to map subscription row")?);
                }
            }
        }

        Ok(rows)
    }

    /// Every active subscription, in token order.
    pub fn list_active(&self) -> Result<Vec<Subscription>> {
        self.list(Some(SubscriptionStatus::Active), i64::MAX as usize, 0)
    }

    pub fn get(&self, instrument_token: u32) -> Result<Option<Subscription>> {
        self.conn
            .lock()
            .query_row(
                "SELECT instrument_token, requested_mode, status, assigned_account_id,
                        created_at, updated_at
                 FROM subscriptions WHERE instrument_token = ?1",
                params![instrument_token],
                row_to_subscription,
            )
            .optional()
            .context("failed to fetch subscription")
    }
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let token: i64 = row.get(0)?;
    let mode: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;

    Ok(Subscription {
        instrument_token: token as u32,
        requested_mode: mode.parse().unwrap_or(TickMode::Quote),
        status: status.parse().unwrap_or(SubscriptionStatus::Inactive),
        assigned_account_id: row.get(3)?,
        created_at: parse_rfc3339(&created),
        updated_at: parse_rfc3339(&updated),
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl std::fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore").finish()
    }
}
