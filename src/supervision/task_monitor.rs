// =============================================================================
// Task Monitor — adopts long-lived background tasks and owns their failures
// =============================================================================
//
// Every background task in the service is spawned through a TaskMonitor.
// A task that returns an error or panics is logged with its name and routed
// to its `on_error` hook (or the monitor's fault handler when none was
// given). Cancellation is propagated untouched and never counted as a
// failure. Naked `tokio::spawn` calls outside a monitor are a bug.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

/// Callback invoked with the task name and its terminal error.
pub type ErrorHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Handle to one adopted task. Dropping the handle does not cancel the task;
/// `abort` does.
pub struct MonitoredTask {
    name: String,
    abort: AbortHandle,
}

impl MonitoredTask {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of adopted background tasks.
pub struct TaskMonitor {
    /// Fault handler for tasks spawned without their own `on_error`.
    fault_handler: ErrorHook,
    /// name → (body abort handle, watcher join handle).
    tasks: Mutex<HashMap<String, (AbortHandle, JoinHandle<()>)>>,
}

impl TaskMonitor {
    /// Create a monitor whose default fault handler escalates to an
    /// operator-visible ERROR log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fault_handler: Arc::new(|name, err| {
                error!(task = %name, error = %err, "background task failed — escalating to operator");
            }),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Adopt `body` as a named background task.
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> MonitoredTask
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_with_handler(name, body, None)
    }

    /// Adopt `body` with a task-specific error hook. The hook replaces the
    /// monitor's fault handler for this task only.
    pub fn spawn_with_handler<F>(
        &self,
        name: impl Into<String>,
        body: F,
        on_error: Option<ErrorHook>,
    ) -> MonitoredTask
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let hook = on_error.unwrap_or_else(|| self.fault_handler.clone());

        let inner: JoinHandle<Result<()>> = tokio::spawn(body);
        let abort = inner.abort_handle();

        let watcher_name = name.clone();
        let watcher = tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => {
                    debug!(task = %watcher_name, "background task completed");
                }
                Ok(Err(err)) => {
                    error!(
                        task = %watcher_name,
                        error = %err,
                        chain = ?err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>(),
                        "background task returned error"
                    );
                    hook(&watcher_name, &err);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    // Cancellation is a normal shutdown path, not a failure.
                    debug!(task = %watcher_name, "background task cancelled");
                }
                Err(join_err) => {
                    let err = anyhow::anyhow!("task panicked: {join_err}");
                    error!(task = %watcher_name, error = %err, "background task panicked");
                    hook(&watcher_name, &err);
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some((stale_abort, stale_watcher)) = tasks.insert(name.clone(), (abort.clone(), watcher))
        {
            // Re-spawning under the same name supersedes the old task.
            stale_abort.abort();
            stale_watcher.abort();
            debug!(task = %name, "superseded previously adopted task with same name");
        }

        MonitoredTask { name, abort }
    }

    /// Cancel one task by name. Returns true if the name was registered.
    pub fn cancel(&self, name: &str) -> bool {
        if let Some((abort, watcher)) = self.tasks.lock().remove(name) {
            abort.abort();
            watcher.abort();
            true
        } else {
            false
        }
    }

    /// Cancel every adopted task. Used during shutdown.
    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        let count = tasks.len();
        for (_, (abort, watcher)) in tasks.drain() {
            abort.abort();
            watcher.abort();
        }
        info!(count, "all monitored tasks cancelled");
    }

    /// Names of currently registered tasks.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("tasks", &self.task_names())
            .finish()
    }
}
