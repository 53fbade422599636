// =============================================================================
// Subscription Reloader — debounced, coalesced, rate-limited reload trigger
// =============================================================================
//
// Any number of `trigger()` calls within a debounce window collapse into one
// reload. The debounce extends while triggers keep arriving, capped at
// `max_debounce`; reload starts are additionally spaced by `min_gap`. A
// capacity-1 semaphore guarantees at most one reload runs at a time.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

pub struct SubscriptionReloader {
    pending: AtomicBool,
    notify: Notify,
    last_trigger: Mutex<Instant>,
    last_reload_start: Mutex<Option<Instant>>,
    reload_lock: Semaphore,
    debounce: Duration,
    max_debounce: Duration,
    min_gap: Duration,
    reloads_executed: AtomicU64,
    triggers_received: AtomicU64,
}

impl SubscriptionReloader {
    pub fn new(debounce_ms: u64, max_debounce_ms: u64, min_gap_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            last_trigger: Mutex::new(Instant::now()),
            last_reload_start: Mutex::new(None),
            reload_lock: Semaphore::new(1),
            debounce: Duration::from_millis(debounce_ms),
            max_debounce: Duration::from_millis(max_debounce_ms.max(debounce_ms)),
            min_gap: Duration::from_millis(min_gap_ms),
            reloads_executed: AtomicU64::new(0),
            triggers_received: AtomicU64::new(0),
        })
    }

    /// Request a reload. Safe from any task; never blocks.
    pub fn trigger(&self) {
        self.triggers_received.fetch_add(1, Ordering::Relaxed);
        *self.last_trigger.lock() = Instant::now();
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Number of reloads actually executed.
    pub fn reloads_executed(&self) -> u64 {
        self.reloads_executed.load(Ordering::Relaxed)
    }

    /// Number of triggers received (for health reporting).
    pub fn triggers_received(&self) -> u64 {
        self.triggers_received.load(Ordering::Relaxed)
    }

    /// Background loop driving the reload callback. Runs until cancelled;
    /// spawn this under the task monitor.
    pub async fn run<F, Fut>(self: Arc<Self>, reload: F) -> anyhow::Result<()>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        loop {
            self.notify.notified().await;
            if !self.pending.load(Ordering::SeqCst) {
                continue;
            }

            // Debounce: wait for the trigger burst to go quiet, but never
            // longer than max_debounce past the first trigger of the burst.
            let burst_start = Instant::now();
            loop {
                tokio::time::sleep(self.debounce).await;
                let quiet_for = self.last_trigger.lock().elapsed();
                if quiet_for >= self.debounce || burst_start.elapsed() >= self.max_debounce {
                    break;
                }
            }

            // Enforce the minimum gap between reload starts.
            let wait = {
                let last = self.last_reload_start.lock();
                last.map(|t| self.min_gap.saturating_sub(t.elapsed()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "spacing reload starts");
                tokio::time::sleep(wait).await;
            }

            // Clear pending before running so triggers arriving mid-reload
            // schedule a fresh pass instead of being lost.
            self.pending.store(false, Ordering::SeqCst);
            *self.last_reload_start.lock() = Some(Instant::now());

            let permit = self
                .reload_lock
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("reload semaphore closed"))?;

            let started = Instant::now();
            match reload().await {
                Ok(()) => {
                    self.reloads_executed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        total = self.reloads_executed(),
                        "subscription reload completed"
                    );
                }
                Err(e) => {
                    // Pending state stays consistent: the next trigger will
                    // schedule another reload.
                    self.reloads_executed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "subscription reload failed — continuing");
                }
            }
            drop(permit);
        }
    }
}

impl std::fmt::Debug for SubscriptionReloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReloader")
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("debounce", &self.debounce)
            .field("min_gap", &self.min_gap)
            .field("reloads_executed", &self.reloads_executed())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_reload(counter: Arc<AtomicU32>) -> impl Fn() -> futures_util::future::Ready<anyhow::Result<()>> {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn burst_of_triggers_coalesces_into_one_reload() {
        let reloader = SubscriptionReloader::new(30, 200, 0);
        let count = Arc::new(AtomicU32::new(0));

        let loop_handle = tokio::spawn(reloader.clone().run(counting_reload(count.clone())));

        for _ in 0..100 {
            reloader.trigger();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reloader.reloads_executed(), 1);
        loop_handle.abort();
    }

    #[tokio::test]
    async fn separated_bursts_each_reload() {
        let reloader = SubscriptionReloader::new(20, 100, 0);
        let count = Arc::new(AtomicU32::new(0));

        let loop_handle = tokio::spawn(reloader.clone().run(counting_reload(count.clone())));

        reloader.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;
        reloader.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        loop_handle.abort();
    }

    #[tokio::test]
    async fn no_reload_without_trigger() {
        let reloader = SubscriptionReloader::new(10, 50, 0);
        let count = Arc::new(AtomicU32::new(0));

        let loop_handle = tokio::spawn(reloader.clone().run(counting_reload(count.clone())));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        loop_handle.abort();
    }

    #[tokio::test]
    async fn failed_reload_does_not_wedge_the_loop() {
        let reloader = SubscriptionReloader::new(10, 50, 0);
        let count = Arc::new(AtomicU32::new(0));
        let fail_count = count.clone();

        let loop_handle = tokio::spawn(reloader.clone().run(move || {
            let n = fail_count.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(if n == 0 {
                Err(anyhow::anyhow!("transient store failure"))
            } else {
                Ok(())
            })
        }));

        reloader.trigger();
        tokio::time::sleep(Duration::from_millis(80)).await;
        reloader.trigger();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        loop_handle.abort();
    }
}
