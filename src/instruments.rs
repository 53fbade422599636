// =============================================================================
// Instrument Registry — cached broker metadata with daily refresh
// =============================================================================
//
// Caches the broker's instrument dump keyed by token. Refresh triggers:
// the first access after an IST calendar-day boundary, cache age beyond the
// staleness interval, or an explicit admin call. Refresh is single-flight:
// concurrent callers await the in-flight fetch instead of stampeding the
// broker. Tokens that stay unresolved after a refresh are deregistered and
// their subscriptions get deactivated by the coordinator.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::client::BrokerApi;
use crate::greeks::ExpiryClock;
use crate::types::Instrument;

pub struct InstrumentRegistry {
    broker: Arc<dyn BrokerApi>,
    clock: Arc<ExpiryClock>,
    staleness: Duration,
    cache: RwLock<HashMap<u32, Arc<Instrument>>>,
    /// (wall age anchor, IST day) of the last completed refresh.
    refreshed_at: RwLock<Option<(Instant, NaiveDate)>>,
    /// Single-flight gate; bumps `generation` on completion.
    refresh_gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl InstrumentRegistry {
    pub fn new(broker: Arc<dyn BrokerApi>, clock: Arc<ExpiryClock>, staleness: Duration) -> Self {
        Self {
            broker,
            clock,
            staleness,
            cache: RwLock::new(HashMap::new()),
            refreshed_at: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Cached lookup; never refreshes.
    pub fn get(&self, token: u32) -> Option<Arc<Instrument>> {
        self.cache.read().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match *self.refreshed_at.read() {
            None => true,
            Some((at, day)) => {
                day != self.clock.market_date(now) || at.elapsed() >= self.staleness
            }
        }
    }

    /// Refresh the cache if any trigger fires. Cheap when fresh.
    pub async fn ensure_fresh(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.needs_refresh(now) {
            return Ok(());
        }
        self.refresh(now).await.map(|_| ())
    }

    /// Force a refresh (admin trigger). Concurrent callers coalesce onto one
    /// broker fetch.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let generation_before = self.generation();
        let _gate = self.refresh_gate.lock().await;

        // Someone else completed a refresh while we waited for the gate.
        if self.generation() != generation_before {
            return Ok(self.len());
        }

        let instruments = self
            .broker
            .fetch_instruments()
            .await
            .context("instrument refresh failed")?;

        let mut fresh: HashMap<u32, Arc<Instrument>> = HashMap::with_capacity(instruments.len());
        for instrument in instruments {
            fresh.insert(instrument.instrument_token, Arc::new(instrument));
        }
        let count = fresh.len();

        *self.cache.write() = fresh;
        *self.refreshed_at.write() = Some((Instant::now(), self.clock.market_date(now)));
        self.generation.fetch_add(1, Ordering::SeqCst);

        info!(count, "instrument registry refreshed");
        Ok(count)
    }

    /// Resolve tokens against a fresh cache.
    ///
    /// Returns the resolved map plus the tokens the broker no longer
    /// recognizes (deregistered); the caller deactivates those.
    pub async fn resolve_many(
        &self,
        tokens: &[u32],
        now: DateTime<Utc>,
    ) -> Result<(HashMap<u32, Arc<Instrument>>, Vec<u32>)> {
        self.ensure_fresh(now).await?;

        let cache = self.cache.read();
        let mut resolved = HashMap::new();
        let mut deregistered = Vec::new();
        for &token in tokens {
            match cache.get(&token) {
                Some(instrument) => {
                    resolved.insert(token, instrument.clone());
                }
                None => deregistered.push(token),
            }
        }

        if !deregistered.is_empty() {
            warn!(
                count = deregistered.len(),
                "tokens unresolved after refresh — treating as deregistered"
            );
        }
        Ok((resolved, deregistered))
    }
}

impl std::fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("cached", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}
