// =============================================================================
// Order Executor — bounded, persistent task queue with retries and DLQ
// =============================================================================
//
// Submissions deduplicate on an idempotency key (operation + params +
// account) within a rolling window. A worker polls for due pending tasks,
// runs them against the broker under a per-account circuit breaker, and
// retries failures with exponential backoff and jitter until the attempt
// cap moves the task to the dead-letter queue. An open breaker re-queues
// the task without consuming an attempt.
//
// Memory discipline: the in-memory working set is capped; beyond the cap,
// completed tasks are evicted in LRU order. Dead-letter tasks are never
// silently evicted — they are already persisted and stay visible via
// `get`, which falls back to the store. Pending and running tasks are
// never evicted.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::client::BrokerApi;
use crate::errors::ServiceError;
use crate::session::SessionOrchestrator;
use crate::store::order_tasks::{OrderTask, OrderTaskStore, TaskStatus};
use crate::supervision::{BreakerState, CircuitBreaker};
use crate::types::OrderOperation;

/// Retry backoff ceiling.
const BACKOFF_CAP: Duration = Duration::minutes(5);
/// Broker-call circuit breaker parameters (per account).
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutorCounters {
    pub submitted: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub breaker_requeues: u64,
}

pub struct OrderExecutor {
    broker: Arc<dyn BrokerApi>,
    sessions: Arc<SessionOrchestrator>,
    store: OrderTaskStore,
    max_tasks: usize,
    max_attempts: u32,
    poll_interval: StdDuration,
    idempotency_window: Duration,

    tasks: Mutex<HashMap<Uuid, OrderTask>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    running: AtomicBool,

    submitted: AtomicU64,
    deduplicated: AtomicU64,
    completed: AtomicU64,
    dead_lettered: AtomicU64,
    breaker_requeues: AtomicU64,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        sessions: Arc<SessionOrchestrator>,
        store: OrderTaskStore,
        max_tasks: usize,
        max_attempts: u32,
        poll_interval_ms: u64,
        idempotency_window_secs: i64,
    ) -> Self {
        Self {
            broker,
            sessions,
            store,
            max_tasks: max_tasks.max(1),
            max_attempts: max_attempts.max(1),
            poll_interval: StdDuration::from_millis(poll_interval_ms.max(10)),
            idempotency_window: Duration::seconds(idempotency_window_secs.max(1)),
            tasks: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            breaker_requeues: AtomicU64::new(0),
        }
    }

    /// Re-adopt open tasks left over from a previous process lifetime.
    pub fn recover(&self) -> Result<usize> {
        let open = self.store.list_open()?;
        let count = open.len();
        let mut tasks = self.tasks.lock();
        for mut task in open {
            // A task caught mid-run by a crash goes back to pending.
            if task.status == TaskStatus::Running || task.status == TaskStatus::Failed {
                task.status = TaskStatus::Pending;
            }
            tasks.insert(task.task_id, task);
        }
        if count > 0 {
            info!(count, "recovered open order tasks from store");
        }
        Ok(count)
    }

    /// Submit an order task. An equivalent submission within the
    /// idempotency window returns the existing task id without enqueuing.
    pub fn submit(
        &self,
        operation: OrderOperation,
        params: Value,
        account_id: &str,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let key = idempotency_key(operation, &params, account_id);
        let window_start = now - self.idempotency_window;

        // Fast path: working set.
        {
            let tasks = self.tasks.lock();
            if let Some(existing) = tasks
                .values()
                .filter(|t| t.idempotency_key == key && t.created_at >= window_start)
                .max_by_key(|t| t.created_at)
            {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(task = %existing.task_id, "duplicate submission within window");
                return Ok(existing.task_id);
            }
        }

        // Slow path: the store may remember a task this process evicted.
        if let Some(existing) = self.store.find_in_window(&key, window_start)? {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            return Ok(existing.task_id);
        }

        let task = OrderTask {
            task_id: Uuid::new_v4(),
            operation,
            params,
            account_id: account_id.to_string(),
            idempotency_key: key,
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
            next_attempt_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        self.store.persist(&task)?;
        let id = task.task_id;
        {
            let mut tasks = self.tasks.lock();
            tasks.insert(id, task);
            Self::enforce_capacity(&mut tasks, self.max_tasks);
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(task = %id, op = %operation, account = %account_id, "order task submitted");
        Ok(id)
    }

    /// Current task state; falls back to the store for evicted tasks.
    pub fn get(&self, task_id: Uuid) -> Result<Option<OrderTask>> {
        if let Some(task) = self.tasks.lock().get(&task_id) {
            return Ok(Some(task.clone()));
        }
        self.store.get(task_id)
    }

    /// Dead-letter tasks from persistent storage, newest first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<OrderTask>> {
        self.store.list_dead_letter(limit)
    }

    pub fn counters(&self) -> ExecutorCounters {
        ExecutorCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            breaker_requeues: self.breaker_requeues.load(Ordering::Relaxed),
        }
    }

    pub fn breaker_states(&self) -> HashMap<String, BreakerState> {
        self.breakers
            .lock()
            .iter()
            .map(|(account, breaker)| (account.clone(), breaker.state()))
            .collect()
    }

    /// Worker loop. Spawn under the task monitor.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.poll_interval).await;
            self.tick(Utc::now()).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run every due pending task once. Exposed separately from `run` so
    /// tests can step deterministically.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let mut handled = 0;
        while let Some(task_id) = self.acquire_due(now) {
            self.execute(task_id, now).await;
            handled += 1;
        }
        handled
    }

    /// Pick the earliest-due pending task and mark it running. The queue
    /// mutex is held only for the pick, never across the broker call.
    fn acquire_due(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let mut tasks = self.tasks.lock();
        let id = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.next_attempt_at.map(|at| at <= now).unwrap_or(true)
            })
            .min_by_key(|t| t.next_attempt_at)
            .map(|t| t.task_id)?;

        if let Some(task) = tasks.get_mut(&id) {
            task.status = TaskStatus::Running;
            task.updated_at = now;
        }
        Some(id)
    }

    async fn execute(&self, task_id: Uuid, now: DateTime<Utc>) {
        let Some(task) = self.tasks.lock().get(&task_id).cloned() else {
            return;
        };

        let breaker = self.breaker_for(&task.account_id);

        // An open breaker re-queues without consuming an attempt.
        if !breaker.may_execute() {
            self.breaker_requeues.fetch_add(1, Ordering::Relaxed);
            self.update_task(task_id, |t| {
                t.status = TaskStatus::Pending;
                t.next_attempt_at = Some(now + Duration::from_std(self.poll_interval).unwrap_or(Duration::seconds(1)));
                t.updated_at = now;
            });
            debug!(task = %task_id, account = %task.account_id, "breaker open — task re-queued");
            return;
        }

        self.update_task(task_id, |t| {
            t.status = TaskStatus::Running;
            t.updated_at = now;
        });

        let outcome = self
            .broker
            .execute_order(&task.account_id, task.operation, &task.params)
            .await;

        match outcome {
            Ok(result) => {
                breaker.record_success();
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.update_task(task_id, |t| {
                    t.status = TaskStatus::Completed;
                    t.result = Some(result.clone());
                    t.next_attempt_at = None;
                    t.updated_at = now;
                });
                info!(task = %task_id, account = %task.account_id, "order task completed");
                let mut tasks = self.tasks.lock();
                Self::enforce_capacity(&mut tasks, self.max_tasks);
            }
            Err(ServiceError::RateLimited(reason)) => {
                // Not a broker fault: wait a poll and go again, attempt intact.
                debug!(task = %task_id, reason = %reason, "rate limited — re-queued without attempt");
                self.update_task(task_id, |t| {
                    t.status = TaskStatus::Pending;
                    t.next_attempt_at = Some(now + Duration::from_std(self.poll_interval).unwrap_or(Duration::seconds(1)));
                    t.updated_at = now;
                });
            }
            Err(err) => {
                if let ServiceError::Auth { account, .. } = &err {
                    self.sessions.mark_unhealthy(account);
                }
                breaker.record_failure();
                self.fail_task(task_id, &err, now);
            }
        }
    }

    fn fail_task(&self, task_id: Uuid, err: &ServiceError, now: DateTime<Utc>) {
        let max_attempts = self.max_attempts;
        let mut dead = false;

        self.update_task(task_id, |t| {
            t.attempt_count += 1;
            t.last_error = Some(err.to_string());
            t.updated_at = now;

            if t.attempt_count >= max_attempts {
                t.status = TaskStatus::DeadLetter;
                t.next_attempt_at = None;
                dead = true;
            } else {
                t.status = TaskStatus::Pending;
                t.next_attempt_at = Some(now + retry_backoff(t.attempt_count));
            }
        });

        if dead {
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            warn!(task = %task_id, error = %err, "order task dead-lettered");
        } else {
            debug!(task = %task_id, error = %err, "order task failed — retry scheduled");
        }
    }

    /// Apply a mutation to a task in memory and write it through.
    fn update_task(&self, task_id: Uuid, mutate: impl FnOnce(&mut OrderTask)) {
        let updated = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    mutate(task);
                    Some(task.clone())
                }
                None => None,
            }
        };
        if let Some(task) = updated {
            if let Err(e) = self.store.persist(&task) {
                warn!(task = %task_id, error = %e, "failed to persist task transition");
            }
        }
    }

    fn breaker_for(&self, account_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("orders:{account_id}"),
                    BREAKER_THRESHOLD,
                    BREAKER_RECOVERY,
                    1,
                ))
            })
            .clone()
    }

    /// Evict completed tasks (LRU by update time) once the working set
    /// exceeds the cap. Dead-letter entries leave memory only after the
    /// completed pool is exhausted; they stay in the store either way.
    /// Pending and running tasks are never evicted.
    fn enforce_capacity(tasks: &mut HashMap<Uuid, OrderTask>, max_tasks: usize) {
        while tasks.len() > max_tasks {
            let completed_lru = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .min_by_key(|t| t.updated_at)
                .map(|t| t.task_id);

            let victim = completed_lru.or_else(|| {
                tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::DeadLetter)
                    .min_by_key(|t| t.updated_at)
                    .map(|t| t.task_id)
            });

            match victim {
                Some(id) => {
                    tasks.remove(&id);
                    debug!(task = %id, "task evicted from working set (persisted copy retained)");
                }
                None => {
                    // Only pending/running remain; the cap yields to them.
                    warn!(len = tasks.len(), max_tasks, "working set over cap with no evictable tasks");
                    break;
                }
            }
        }
    }
}

/// Deterministic fingerprint of (operation, params, account).
/// serde_json sorts object keys, so equal params hash equally regardless
/// of construction order.
pub fn idempotency_key(operation: OrderOperation, params: &Value, account_id: &str) -> String {
    let canonical = format!("{operation}|{account_id}|{params}");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// base · 2^(attempts−1) with jitter, capped.
fn retry_backoff(attempts: u32) -> Duration {
    let base = Duration::seconds(1);
    let exp = base * 2i32.saturating_pow(attempts.saturating_sub(1)).min(512);
    let capped = if exp > BACKOFF_CAP { BACKOFF_CAP } else { exp };
    let jitter = Duration::milliseconds(rand::thread_rng().gen_range(0..250));
    capped + jitter
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("tasks", &self.tasks.lock().len())
            .field("max_tasks", &self.max_tasks)
            .field("counters", &self.counters())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::testing::ScriptedBroker;
    use rusqlite::Connection;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn harness(
        failures: u32,
        max_tasks: usize,
        max_attempts: u32,
    ) -> (Arc<OrderExecutor>, Arc<ScriptedBroker>) {
        let broker = Arc::new(ScriptedBroker::new());
        broker
            .order_failures_before_success
            .store(failures, AtomicOrdering::SeqCst);

        let sessions = Arc::new(SessionOrchestrator::new(StdDuration::from_secs(1)));
        sessions.register_account("primary");

        let store = OrderTaskStore::with_connection(Arc::new(Mutex::new(
            Connection::open_in_memory().unwrap(),
        )))
        .unwrap();

        let executor = Arc::new(OrderExecutor::new(
            broker.clone(),
            sessions,
            store,
            max_tasks,
            max_attempts,
            1000,
            300,
        ));
        (executor, broker)
    }

    fn place_params() -> Value {
        serde_json::json!({
            "tradingsymbol": "NIFTY25NOVFUT",
            "transaction_type": "BUY",
            "quantity": 50,
            "order_type": "MARKET"
        })
    }

    #[tokio::test]
    async fn duplicate_submit_returns_the_same_id_and_runs_once() {
        let (exec, broker) = harness(0, 100, 5);

        let a = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();
        let b = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(exec.counters().deduplicated, 1);

        exec.tick(Utc::now()).await;
        assert_eq!(broker.order_calls.load(AtomicOrdering::SeqCst), 1);

        let task = exec.get(a).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 0);
    }

    #[tokio::test]
    async fn different_params_get_different_tasks() {
        let (exec, _) = harness(0, 100, 5);
        let a = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();
        let mut other = place_params();
        other["quantity"] = serde_json::json!(100);
        let b = exec.submit(OrderOperation::Place, other, "primary").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_then_complete() {
        let (exec, broker) = harness(2, 100, 5);
        let id = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();

        let t0 = Utc::now();
        exec.tick(t0).await;
        let after_first = exec.get(id).unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.attempt_count, 1);
        assert!(after_first.next_attempt_at.unwrap() > t0);

        // Not yet due: nothing runs.
        assert_eq!(exec.tick(t0).await, 0);

        // Step far past each backoff.
        exec.tick(t0 + Duration::minutes(1)).await;
        exec.tick(t0 + Duration::minutes(10)).await;

        let done = exec.get(id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt_count, 2);
        assert_eq!(broker.order_calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_and_stay_there() {
        let (exec, broker) = harness(u32::MAX, 100, 3);
        let id = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();

        let mut now = Utc::now();
        for _ in 0..5 {
            exec.tick(now).await;
            now += Duration::minutes(10);
        }

        let task = exec.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::DeadLetter);
        assert_eq!(task.attempt_count, 3);
        assert!(task.last_error.is_some());
        // No further broker calls once dead.
        assert_eq!(broker.order_calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(exec.counters().dead_lettered, 1);
    }

    #[tokio::test]
    async fn open_breaker_requeues_without_consuming_attempts() {
        let (exec, broker) = harness(u32::MAX, 100, 50);
        let id = exec
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();

        // Drive the per-account breaker open (threshold 5).
        let mut now = Utc::now();
        for _ in 0..5 {
            exec.tick(now).await;
            now += Duration::minutes(10);
        }
        assert_eq!(
            exec.breaker_states().get("primary"),
            Some(&BreakerState::Open)
        );
        let attempts_at_open = exec.get(id).unwrap().unwrap().attempt_count;
        let calls_at_open = broker.order_calls.load(AtomicOrdering::SeqCst);

        // While open: re-queued, no attempt consumed, broker untouched.
        exec.tick(now).await;
        let task = exec.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, attempts_at_open);
        assert_eq!(broker.order_calls.load(AtomicOrdering::SeqCst), calls_at_open);
        assert!(exec.counters().breaker_requeues >= 1);
    }

    #[tokio::test]
    async fn completed_tasks_evict_lru_but_remain_in_store() {
        let (exec, _) = harness(0, 2, 5);

        let mut ids = Vec::new();
        for i in 0..4 {
            let mut params = place_params();
            params["quantity"] = serde_json::json!(50 + i);
            let id = exec
                .submit(OrderOperation::Place, params, "primary")
                .unwrap();
            exec.tick(Utc::now()).await;
            ids.push(id);
        }

        assert!(exec.tasks.lock().len() <= 2);
        // Every task, evicted or not, stays visible.
        for id in ids {
            let task = exec.get(id).unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn recover_restores_open_tasks() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let store = OrderTaskStore::with_connection(conn.clone()).unwrap();

        let broker = Arc::new(ScriptedBroker::new());
        let sessions = Arc::new(SessionOrchestrator::new(StdDuration::from_secs(1)));
        sessions.register_account("primary");

        // First executor submits but never runs.
        let first = OrderExecutor::new(
            broker.clone(),
            sessions.clone(),
            OrderTaskStore::with_connection(conn.clone()).unwrap(),
            100,
            5,
            1000,
            300,
        );
        let id = first
            .submit(OrderOperation::Place, place_params(), "primary")
            .unwrap();
        drop(first);

        // Second executor adopts it and completes it.
        let second = OrderExecutor::new(broker, sessions, store, 100, 5, 1000, 300);
        assert_eq!(second.recover().unwrap(), 1);
        second.tick(Utc::now()).await;
        assert_eq!(
            second.get(id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }
}
