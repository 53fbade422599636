// =============================================================================
// Session Orchestrator — leased access to per-account broker sessions
// =============================================================================
//
// Historical fetches and live subscribe/unsubscribe calls for an account
// must run under that account's lease, which serializes them against the
// broker's per-account rate limits. Leases queue FIFO; acquisition carries
// a mandatory timeout that surfaces as its own error kind. Health flags
// gate assignment: an unhealthy account receives no instruments.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease acquisition for account {account} timed out after {waited_ms} ms")]
    Timeout { account: String, waited_ms: u64 },

    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

struct AccountSession {
    gate: Arc<Semaphore>,
    healthy: AtomicBool,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

/// Scoped lease over one account's broker session. Dropping releases it.
#[derive(Debug)]
pub struct SessionLease {
    account_id: String,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

pub struct SessionOrchestrator {
    lease_timeout: Duration,
    accounts: RwLock<HashMap<String, Arc<AccountSession>>>,
}

impl SessionOrchestrator {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            lease_timeout,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_account(&self, account_id: impl Into<String>) {
        let account_id = account_id.into();
        let mut accounts = self.accounts.write();
        accounts.entry(account_id.clone()).or_insert_with(|| {
            info!(account = %account_id, "account session registered");
            Arc::new(AccountSession {
                gate: Arc::new(Semaphore::new(1)),
                healthy: AtomicBool::new(true),
                last_tick_at: RwLock::new(None),
            })
        });
    }

    /// Healthy account ids in registration-stable (sorted) order.
    pub fn healthy_accounts(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .accounts
            .read()
            .iter()
            .filter(|(_, s)| s.healthy.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    /// Exclude an account from assignment (credential failure etc.).
    pub fn mark_unhealthy(&self, account_id: &str) {
        if let Some(session) = self.accounts.read().get(account_id) {
            session.healthy.store(false, Ordering::SeqCst);
            warn!(account = %account_id, "account marked unhealthy — excluded from assignment");
        }
    }

    pub fn mark_healthy(&self, account_id: &str) {
        if let Some(session) = self.accounts.read().get(account_id) {
            session.healthy.store(true, Ordering::SeqCst);
            info!(account = %account_id, "account marked healthy");
        }
    }

    pub fn is_healthy(&self, account_id: &str) -> bool {
        self.accounts
            .read()
            .get(account_id)
            .map(|s| s.healthy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Acquire the account's lease, suspending until it is free or the
    /// timeout elapses. Leases queue in FIFO order.
    pub async fn lease(&self, account_id: &str) -> Result<SessionLease, LeaseError> {
        let gate = {
            let accounts = self.accounts.read();
            accounts
                .get(account_id)
                .ok_or_else(|| LeaseError::UnknownAccount(account_id.to_string()))?
                .gate
                .clone()
        };

        let permit = tokio::time::timeout(self.lease_timeout, gate.acquire_owned())
            .await
            .map_err(|_| LeaseError::Timeout {
                account: account_id.to_string(),
                waited_ms: self.lease_timeout.as_millis() as u64,
            })?
            .map_err(|_| LeaseError::UnknownAccount(account_id.to_string()))?;

        debug!(account = %account_id, "session lease acquired");
        Ok(SessionLease {
            account_id: account_id.to_string(),
            _permit: permit,
        })
    }

    /// Record tick receipt for an account's health view.
    pub fn record_tick(&self, account_id: &str, at: DateTime<Utc>) {
        if let Some(session) = self.accounts.read().get(account_id) {
            *session.last_tick_at.write() = Some(at);
        }
    }

    pub fn last_tick_at(&self, account_id: &str) -> Option<DateTime<Utc>> {
        self.accounts
            .read()
            .get(account_id)
            .and_then(|s| *s.last_tick_at.read())
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("accounts", &self.accounts.read().len())
            .field("lease_timeout", &self.lease_timeout)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_serializes_access() {
        let orch = SessionOrchestrator::new(Duration::from_secs(5));
        orch.register_account("primary");

        let first = orch.lease("primary").await.unwrap();

        // Second lease must wait until the first is dropped.
        let pending = tokio::time::timeout(Duration::from_millis(50), orch.lease("primary")).await;
        assert!(pending.is_err(), "second lease should still be queued");

        drop(first);
        let second = orch.lease("primary").await.unwrap();
        assert_eq!(second.account_id(), "primary");
    }

    #[tokio::test]
    async fn lease_timeout_is_a_distinct_error() {
        let orch = SessionOrchestrator::new(Duration::from_millis(50));
        orch.register_account("primary");

        let held = orch.lease("primary").await.unwrap();
        match orch.lease("primary").await {
            Err(LeaseError::Timeout { account, .. }) => assert_eq!(account, "primary"),
            other => panic!("expected timeout, got {other:?}"),
        }
        drop(held);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let orch = SessionOrchestrator::new(Duration::from_secs(1));
        assert!(matches!(
            orch.lease("ghost").await,
            Err(LeaseError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn health_flags_gate_assignment() {
        let orch = SessionOrchestrator::new(Duration::from_secs(1));
        orch.register_account("a");
        orch.register_account("b");
        orch.register_account("c");

        assert_eq!(orch.healthy_accounts(), vec!["a", "b", "c"]);

        orch.mark_unhealthy("b");
        assert_eq!(orch.healthy_accounts(), vec!["a", "c"]);
        assert!(!orch.is_healthy("b"));

        orch.mark_healthy("b");
        assert_eq!(orch.healthy_accounts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn leases_are_independent_across_accounts() {
        let orch = SessionOrchestrator::new(Duration::from_secs(1));
        orch.register_account("a");
        orch.register_account("b");

        let _a = orch.lease("a").await.unwrap();
        // Account b is unaffected by a's lease.
        let _b = orch.lease("b").await.unwrap();
    }

    #[tokio::test]
    async fn tick_receipt_is_recorded() {
        let orch = SessionOrchestrator::new(Duration::from_secs(1));
        orch.register_account("a");
        assert!(orch.last_tick_at("a").is_none());

        let now = Utc::now();
        orch.record_tick("a", now);
        assert_eq!(orch.last_tick_at("a"), Some(now));
    }
}
