// =============================================================================
// Mock Generator — realistic synthetic underlying bars and option quotes
// =============================================================================
//
// Underlying prices follow a mean-reverting Brownian walk around a per-day
// anchor, clamped to a maximum daily range. Option quotes are rebuilt from
// the latest underlying snapshot: intrinsic value plus a small
// volatility-scaled noise term, rounded to the instrument's tick size.
// Updates run under one serializing mutex; consumers read immutable
// snapshots out of the state cache.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

use crate::mock::cache::MockStateCache;
use crate::types::{Instrument, OptionKind};

/// Mean-reversion speed toward the daily anchor.
const REVERSION: f64 = 0.05;
/// Per-step volatility as a fraction of the anchor.
const STEP_VOL: f64 = 0.0004;
/// Daily range clamp around the anchor.
const MAX_DAILY_RANGE: f64 = 0.02;
/// Noise applied to option quotes, scaled by the underlying move.
const OPTION_NOISE: f64 = 0.15;

/// One synthetic quote, stored in the state cache.
#[derive(Debug, Clone, PartialEq)]
pub struct MockQuote {
    pub instrument_token: u32,
    pub last_price: f64,
    pub volume: u64,
    pub oi: Option<u64>,
    pub expiry: Option<NaiveDate>,
    pub timestamp: DateTime<Utc>,
}

struct UnderlyingWalk {
    anchor: f64,
    price: f64,
    volume: u64,
}

pub struct MockGenerator {
    cache: Arc<MockStateCache>,
    /// underlying symbol → walk state, serialized under one mutex.
    walks: Mutex<HashMap<String, UnderlyingWalk>>,
    normal: Normal,
}

impl MockGenerator {
    pub fn new(cache: Arc<MockStateCache>) -> Self {
        Self {
            cache,
            walks: Mutex::new(HashMap::new()),
            normal: Normal::new(0.0, 1.0).expect("unit normal parameters are valid"),
        }
    }

    /// Advance the synthetic walk for an underlying and cache the quote.
    ///
    /// `anchor_price` seeds the walk on first sight of the symbol (a
    /// plausible reference close for the instrument).
    pub fn next_underlying(
        &self,
        instrument: &Instrument,
        anchor_price: f64,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> MockQuote {
        let mut rng = rand::thread_rng();
        let mut walks = self.walks.lock();

        let walk = walks
            .entry(instrument.underlying_symbol.clone())
            .or_insert_with(|| UnderlyingWalk {
                anchor: anchor_price,
                price: anchor_price,
                volume: 0,
            });

        let eps: f64 = self.normal.sample(&mut rng);
        let drift = REVERSION * (walk.anchor - walk.price);
        let shock = STEP_VOL * walk.anchor * eps;
        let lo = walk.anchor * (1.0 - MAX_DAILY_RANGE);
        let hi = walk.anchor * (1.0 + MAX_DAILY_RANGE);
        walk.price = (walk.price + drift + shock).clamp(lo, hi);
        walk.volume += rng.gen_range(1..500);

        let quote = MockQuote {
            instrument_token: instrument.instrument_token,
            last_price: round_to_tick(walk.price, instrument.tick_size),
            volume: walk.volume,
            oi: None,
            expiry: instrument.expiry,
            timestamp: now,
        };
        drop(walks);

        self.cache.insert(instrument.instrument_token, quote.clone(), today);
        quote
    }

    /// Build a synthetic option quote from the latest underlying walk.
    ///
    /// Returns `None` until the underlying has been walked at least once.
    pub fn next_option(
        &self,
        instrument: &Instrument,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<MockQuote> {
        let (strike, kind) = match (instrument.strike, instrument.option_kind) {
            (Some(s), Some(k)) => (s, k),
            _ => return None,
        };

        let spot = {
            let walks = self.walks.lock();
            walks.get(&instrument.underlying_symbol).map(|w| w.price)?
        };

        let intrinsic = match kind {
            OptionKind::Call => (spot - strike).max(0.0),
            OptionKind::Put => (strike - spot).max(0.0),
        };

        let mut rng = rand::thread_rng();
        let eps: f64 = self.normal.sample(&mut rng);
        let noise = OPTION_NOISE * spot * STEP_VOL * eps.abs();
        let price = (intrinsic + noise).max(instrument.tick_size);

        let quote = MockQuote {
            instrument_token: instrument.instrument_token,
            last_price: round_to_tick(price, instrument.tick_size),
            volume: rng.gen_range(0..10_000),
            oi: Some(rng.gen_range(10_000..5_000_000)),
            expiry: instrument.expiry,
            timestamp: now,
        };

        self.cache.insert(instrument.instrument_token, quote.clone(), today);
        Some(quote)
    }
}

fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

impl std::fmt::Debug for MockGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGenerator")
            .field("walks", &self.walks.lock().len())
            .finish()
    }
}
