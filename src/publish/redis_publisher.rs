// =============================================================================
// Redis Publisher — pooled pub/sub fan-out behind a circuit breaker
// =============================================================================
//
// Publishing must never block or fail tick streaming. While the breaker is
// OPEN, `publish` returns in O(µs) and the message is dropped with a counter
// increment. Otherwise the send gets one retry on a connection error and a
// hard 2 s deadline; a final failure feeds the breaker. Errors never reach
// callers.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::supervision::{BreakerState, CircuitBreaker};

/// Hard deadline on one publish attempt.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Seam for the batcher and coordinator: anything that can carry one
/// fire-and-forget message to a channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver one message. Must not propagate delivery failures.
    async fn publish(&self, channel: &str, message: String);
}

/// Pooled Redis pub/sub client wrapped in a circuit breaker.
pub struct RedisPublisher {
    /// Round-robin pool of multiplexed connections.
    pool: Vec<ConnectionManager>,
    next: AtomicUsize,
    breaker: CircuitBreaker,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl RedisPublisher {
    /// Connect a pool of `pool_size` managed connections to `url`.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;

        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let manager = client
                .get_tokio_connection_manager()
                .await
                .context("failed to establish redis connection")?;
            pool.push(manager);
        }

        info!(url = %url, pool_size = pool.len(), "redis publisher connected");

        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            breaker: CircuitBreaker::new("redis", failure_threshold, recovery_timeout, 1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Breaker state for health reporting.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Serialize `payload` and publish it. Serialization failures are
    /// programming errors and are logged, not raised.
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(json) => self.publish(channel, json).await,
            Err(e) => {
                warn!(channel, error = %e, "payload serialization failed — message dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn next_connection(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }

    async fn try_send(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.next_connection();
        let send = conn.publish::<_, _, ()>(channel, message);
        tokio::time::timeout(PUBLISH_TIMEOUT, send)
            .await
            .context("publish deadline exceeded")?
            .context("redis publish failed")?;
        Ok(())
    }
}

#[async_trait]
impl MessageSink for RedisPublisher {
    async fn publish(&self, channel: &str, message: String) {
        // Fast-path reject while the breaker is open: streaming must not
        // block on a dead message bus.
        if !self.breaker.may_execute() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.try_send(channel, &message).await {
            Ok(()) => {
                self.breaker.record_success();
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(first_err) => {
                // One retry on connection trouble; the manager reconnects
                // underneath us.
                debug!(channel, error = %first_err, "publish failed — retrying once");
                match self.try_send(channel, &message).await {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(retry_err) => {
                        self.breaker.record_failure();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            channel,
                            error = %retry_err,
                            breaker = %self.breaker.state(),
                            "publish failed after retry — message dropped"
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("pool_size", &self.pool.len())
            .field("breaker", &self.breaker.state())
            .field("published", &self.published())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// =============================================================================
// In-memory sink used across the test suite
// =============================================================================
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every publish; substituted at the `MessageSink` seam.
    #[derive(Default)]
    pub struct InMemorySink {
        pub messages: Mutex<Vec<(String, String)>>,
    }

    impl InMemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count(&self) -> usize {
            self.messages.lock().len()
        }

        pub fn on_channel(&self, channel: &str) -> Vec<String> {
            self.messages
                .lock()
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageSink for InMemorySink {
        async fn publish(&self, channel: &str, message: String) {
            self.messages.lock().push((channel.to_string(), message));
        }
    }
}
