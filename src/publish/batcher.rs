// =============================================================================
// Tick Batcher — time- and size-bounded batching of published messages
// =============================================================================
//
// Two independent batches: underlying bars (deduplicated to the latest bar
// per symbol) and option snapshots. A flush fires when either predicate
// holds: the window has elapsed since the last flush, or the batch reached
// its size cap. Flushes never run in parallel; triggers arriving mid-flush
// coalesce into the next one. Messages within a flush go out in arrival
// order, one publish per message.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::publish::payloads::Channels;
use crate::publish::redis_publisher::MessageSink;
use crate::ticks::frames::{OptionSnapshot, UnderlyingBar};

struct Batches {
    /// Arrival-ordered bars; at most one per symbol (latest wins in place).
    underlying: Vec<UnderlyingBar>,
    underlying_index: HashMap<String, usize>,
    options: Vec<OptionSnapshot>,
    last_flush: Instant,
}

impl Batches {
    fn new() -> Self {
        Self {
            underlying: Vec::new(),
            underlying_index: HashMap::new(),
            options: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    fn len(&self) -> usize {
        self.underlying.len() + self.options.len()
    }
}

pub struct TickBatcher {
    sink: Arc<dyn MessageSink>,
    channels: Channels,
    window: Duration,
    max_batch_size: usize,
    inner: Mutex<Batches>,
    /// Serializes flushes; accumulation continues while one is mid-flight.
    flush_gate: tokio::sync::Mutex<()>,
    size_trigger: Notify,
    running: AtomicBool,
    flushes: AtomicU64,
    messages_out: AtomicU64,
}

impl TickBatcher {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        channels: Channels,
        window_ms: u64,
        max_batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            channels,
            window: Duration::from_millis(window_ms.max(1)),
            max_batch_size: max_batch_size.max(1),
            inner: Mutex::new(Batches::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            size_trigger: Notify::new(),
            running: AtomicBool::new(true),
            flushes: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
        })
    }

    /// Queue an underlying bar; an existing bar for the same symbol is
    /// replaced in place so each flush carries at most one per symbol.
    pub fn push_underlying(&self, bar: UnderlyingBar) {
        let size = {
            let mut b = self.inner.lock();
            match b.underlying_index.get(&bar.symbol).copied() {
                Some(idx) => b.underlying[idx] = bar,
                None => {
                    let idx = b.underlying.len();
                    b.underlying_index.insert(bar.symbol.clone(), idx);
                    b.underlying.push(bar);
                }
            }
            b.len()
        };
        if size >= self.max_batch_size {
            self.size_trigger.notify_one();
        }
    }

    /// Queue an option snapshot.
    pub fn push_option(&self, snapshot: OptionSnapshot) {
        let size = {
            let mut b = self.inner.lock();
            b.options.push(snapshot);
            b.len()
        };
        if size >= self.max_batch_size {
            self.size_trigger.notify_one();
        }
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    /// Background flusher. Spawn under the task monitor; exits after
    /// `stop()`.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.window) => {}
                _ = self.size_trigger.notified() => {}
            }
            self.flush().await;
        }
        Ok(())
    }

    /// Stop the flusher and drain remainders synchronously.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.size_trigger.notify_one();
        self.flush().await;
        info!(
            flushes = self.flushes(),
            messages = self.messages_out(),
            "tick batcher stopped and drained"
        );
    }

    /// Flush whatever has accumulated. No-op when both batches are empty.
    pub async fn flush(&self) {
        // One flush at a time; a trigger firing mid-flight waits here and
        // picks up whatever accumulated meanwhile.
        let _gate = self.flush_gate.lock().await;

        let (bars, options) = {
            let mut b = self.inner.lock();
            if b.len() == 0 {
                b.last_flush = Instant::now();
                return;
            }
            b.last_flush = Instant::now();
            b.underlying_index.clear();
            (
                std::mem::take(&mut b.underlying),
                std::mem::take(&mut b.options),
            )
        };

        let count = bars.len() + options.len();
        for bar in &bars {
            match serde_json::to_string(bar) {
                Ok(json) => self.sink.publish(&self.channels.underlying, json).await,
                Err(e) => debug!(symbol = %bar.symbol, error = %e, "bar serialization failed"),
            }
        }
        for snapshot in &options {
            match serde_json::to_string(snapshot) {
                Ok(json) => self.sink.publish(&self.channels.options, json).await,
                Err(e) => {
                    debug!(token = snapshot.instrument_token, error = %e, "snapshot serialization failed")
                }
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.messages_out.fetch_add(count as u64, Ordering::Relaxed);
        debug!(bars = bars.len(), options = options.len(), "batch flushed");
    }
}

impl std::fmt::Debug for TickBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBatcher")
            .field("window", &self.window)
            .field("max_batch_size", &self.max_batch_size)
            .field("flushes", &self.flushes())
            .finish()
    }
}
