// =============================================================================
// Historical Bootstrapper — one-shot per-account candle backfill
// =============================================================================
//
// On an account's first streaming session in a process lifetime, the last N
// market days of candles are pulled for each assigned instrument, in
// batches, under the account's session lease. Backfill is best-effort: a
// failed instrument is logged and skipped, never fatal. `bootstrap_done`
// resets only through an explicit administrative call.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broker::client::{BrokerApi, Candle};
use crate::greeks::expiry::last_market_days;
use crate::session::SessionOrchestrator;
use crate::types::Instrument;

pub struct HistoricalBootstrapper {
    broker: Arc<dyn BrokerApi>,
    sessions: Arc<SessionOrchestrator>,
    backfill_days: u32,
    batch_size: usize,
    done: Mutex<HashSet<String>>,
}

impl HistoricalBootstrapper {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        sessions: Arc<SessionOrchestrator>,
        backfill_days: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            broker,
            sessions,
            backfill_days,
            batch_size: batch_size.max(1),
            done: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_done(&self, account_id: &str) -> bool {
        self.done.lock().contains(account_id)
    }

    /// Administrative reset: the next session of the account backfills again.
    pub fn reset(&self, account_id: &str) -> bool {
        let removed = self.done.lock().remove(account_id);
        if removed {
            info!(account = %account_id, "bootstrap state reset");
        }
        removed
    }

    /// Backfill candles for `instruments` unless this account already
    /// bootstrapped. Returns the number of candles pulled.
    pub async fn bootstrap(
        &self,
        account_id: &str,
        instruments: &[Arc<Instrument>],
    ) -> Result<usize> {
        if self.is_done(account_id) {
            debug!(account = %account_id, "bootstrap already done — skipping");
            return Ok(0);
        }

        let days = last_market_days(Utc::now(), self.backfill_days);
        let (Some(&from), Some(&to)) = (days.first(), days.last()) else {
            self.done.lock().insert(account_id.to_string());
            return Ok(0);
        };

        let mut pulled = 0usize;
        for batch in instruments.chunks(self.batch_size) {
            // One lease per batch keeps the account's rate budget shared
            // fairly with live subscribe traffic.
            let lease = match self.sessions.lease(account_id).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(account = %account_id, error = %e, "bootstrap lease failed — aborting backfill");
                    break;
                }
            };

            for instrument in batch {
                match self
                    .broker
                    .fetch_candles(account_id, instrument.instrument_token, from, to)
                    .await
                {
                    Ok(candles) => {
                        pulled += candles.len();
                        self.store_candles(instrument, &candles);
                    }
                    Err(e) => {
                        // Best-effort: log and move on.
                        debug!(
                            account = %account_id,
                            token = instrument.instrument_token,
                            error = %e,
                            "candle backfill failed for instrument"
                        );
                    }
                }
            }
            drop(lease);
        }

        self.done.lock().insert(account_id.to_string());
        info!(
            account = %account_id,
            instruments = instruments.len(),
            candles = pulled,
            days = self.backfill_days,
            "historical bootstrap complete"
        );
        Ok(pulled)
    }

    /// Hand candles to downstream consumers. Candle persistence beyond this
    /// seam is outside the engine; the hook exists so a store can be wired
    /// in without touching the backfill loop.
    fn store_candles(&self, instrument: &Instrument, candles: &[Candle]) {
        debug!(
            token = instrument.instrument_token,
            count = candles.len(),
            "candles backfilled"
        );
    }
}

impl std::fmt::Debug for HistoricalBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalBootstrapper")
            .field("backfill_days", &self.backfill_days)
            .field("batch_size", &self.batch_size)
            .field("accounts_done", &self.done.lock().len())
            .finish()
    }
}
