// =============================================================================
// Tick Validator — schema and business-rule screen on incoming ticks
// =============================================================================
//
// The one centralized coercion point: downstream code never re-checks tick
// fields. Lenient mode drops invalid ticks with a counter increment and a
// sampled warning; strict mode aborts the whole batch. Inputs are never
// mutated.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::errors::ServiceError;
use crate::ticks::frames::TickFrame;

/// Sanity ceiling on any last price (rupees). Nothing on NSE/BSE trades
/// anywhere near this.
const PRICE_CEILING: f64 = 10_000_000.0;
/// Broker timestamps further in the future than this are clock garbage.
const MAX_FUTURE_SKEW_SECS: i64 = 300;
/// Permitted regression against the last seen timestamp per token.
const MAX_BACKWARDS_SKEW_SECS: i64 = 5;
/// Emit one warning per this many drops.
const WARN_SAMPLE_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Drop invalid ticks, keep the batch flowing.
    Lenient,
    /// Abort the batch on the first invalid tick.
    Strict,
}

pub struct TickValidator {
    mode: ValidationMode,
    dropped: AtomicU64,
    /// token → last accepted broker timestamp, for monotonicity checks.
    last_seen: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl TickValidator {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            dropped: AtomicU64::new(0),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Screen a batch. Returns the accepted subset in arrival order; in
    /// strict mode an invalid tick fails the whole batch instead.
    pub fn validate_batch(
        &self,
        ticks: &[TickFrame],
        now: DateTime<Utc>,
    ) -> Result<Vec<TickFrame>, ServiceError> {
        let mut accepted = Vec::with_capacity(ticks.len());

        for tick in ticks {
            match self.check(tick, now) {
                Ok(()) => {
                    self.last_seen
                        .lock()
                        .insert(tick.instrument_token, tick.timestamp);
                    accepted.push(tick.clone());
                }
                Err(reason) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % WARN_SAMPLE_EVERY == 1 {
                        warn!(
                            token = tick.instrument_token,
                            reason = %reason,
                            dropped_total = total,
                            "invalid tick dropped (sampled warning)"
                        );
                    }
                    if self.mode == ValidationMode::Strict {
                        return Err(ServiceError::Validation(format!(
                            "tick for token {} rejected: {reason}",
                            tick.instrument_token
                        )));
                    }
                }
            }
        }

        Ok(accepted)
    }

    fn check(&self, tick: &TickFrame, now: DateTime<Utc>) -> Result<(), String> {
        if !tick.last_price.is_finite() || tick.last_price <= 0.0 {
            return Err(format!("non-positive last_price {}", tick.last_price));
        }
        if tick.last_price > PRICE_CEILING {
            return Err(format!("last_price {} above sanity ceiling", tick.last_price));
        }

        if let Some(depth) = &tick.depth {
            for level in depth.buy.iter().chain(depth.sell.iter()) {
                if !level.price.is_finite() || level.price < 0.0 {
                    return Err(format!("bad depth price {}", level.price));
                }
            }
        }

        if let Some(ohlc) = &tick.ohlc {
            let vals = [ohlc.open, ohlc.high, ohlc.low, ohlc.close];
            if vals.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err("bad ohlc values".to_string());
            }
        }

        let skew = tick.timestamp - now;
        if skew > Duration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(format!("timestamp {}s in the future", skew.num_seconds()));
        }

        if let Some(last) = self.last_seen.lock().get(&tick.instrument_token) {
            if *last - tick.timestamp > Duration::seconds(MAX_BACKWARDS_SKEW_SECS) {
                return Err(format!(
                    "timestamp regressed {}s against last tick",
                    (*last - tick.timestamp).num_seconds()
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(token: u32, price: f64, at: DateTime<Utc>) -> TickFrame {
        TickFrame {
            instrument_token: token,
            last_price: price,
            volume: 100,
            timestamp: at,
            oi: None,
            ohlc: None,
            depth: None,
        }
    }

    #[test]
    fn lenient_drops_and_counts() {
        let v = TickValidator::new(ValidationMode::Lenient);
        let now = Utc::now();
        let batch = vec![
            tick(1, 100.0, now),
            tick(2, -5.0, now),
            tick(3, f64::NAN, now),
            tick(4, 250.5, now),
        ];
        let accepted = v.validate_batch(&batch, now).unwrap();
        assert_eq!(
            accepted.iter().map(|t| t.instrument_token).collect::<Vec<_>>(),
            vec![1, 4]
        );
        assert_eq!(v.dropped(), 2);
    }

    #[test]
    fn strict_aborts_the_batch() {
        let v = TickValidator::new(ValidationMode::Strict);
        let now = Utc::now();
        let batch = vec![tick(1, 100.0, now), tick(2, 0.0, now)];
        let err = v.validate_batch(&batch, now).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let v = TickValidator::new(ValidationMode::Lenient);
        let now = Utc::now();
        let batch = vec![tick(1, 100.0, now + Duration::hours(2))];
        assert!(v.validate_batch(&batch, now).unwrap().is_empty());
    }

    #[test]
    fn regression_beyond_tolerance_rejected() {
        let v = TickValidator::new(ValidationMode::Lenient);
        let now = Utc::now();
        let first = vec![tick(1, 100.0, now)];
        assert_eq!(v.validate_batch(&first, now).unwrap().len(), 1);

        // Within tolerance: accepted.
        let slight = vec![tick(1, 100.5, now - Duration::seconds(2))];
        assert_eq!(v.validate_batch(&slight, now).unwrap().len(), 1);

        // Way behind the high-water mark: dropped.
        let stale = vec![tick(1, 101.0, now - Duration::minutes(10))];
        assert!(v.validate_batch(&stale, now).unwrap().is_empty());
    }

    #[test]
    fn inputs_are_not_mutated() {
        let v = TickValidator::new(ValidationMode::Lenient);
        let now = Utc::now();
        let batch = vec![tick(1, 100.0, now)];
        let before = batch.clone();
        let _ = v.validate_batch(&batch, now).unwrap();
        assert_eq!(batch, before);
    }

    #[test]
    fn price_ceiling_enforced() {
        let v = TickValidator::new(ValidationMode::Lenient);
        let now = Utc::now();
        let batch = vec![tick(1, 20_000_000.0, now)];
        assert!(v.validate_batch(&batch, now).unwrap().is_empty());
    }
}
