// =============================================================================
// Tick Processor — per-tick routing, Greeks enrichment, depth normalization
// =============================================================================
//
// Takes a validated batch plus the resolved instrument lookup and routes
// each tick: underlying segments update the reference-price table and emit
// bars; options get an implied-volatility solve and Greeks when a fresh
// underlying reference exists, and are emitted without Greeks otherwise.
// Ticks for expired instruments are skipped. Per-tick problems are counted
// and logged at DEBUG; the processor never fails a batch.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::greeks::{ExpiryClock, GreeksCalculator, IvOutcome};
use crate::mock::{MockGenerator, MockStateCache};
use crate::publish::TickBatcher;
use crate::session::SessionOrchestrator;
use crate::ticks::frames::{NormalizedDepth, Ohlc, OptionSnapshot, TickFrame, UnderlyingBar};
use crate::ticks::validator::TickValidator;
use crate::types::{Instrument, Segment};

/// Counters exposed through the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorCounters {
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub expired_skipped: u64,
    pub missing_underlying: u64,
    pub stale_underlying: u64,
    pub greeks_failures: u64,
    pub mock_emitted: u64,
}

/// Synthetic-data path; wired only when mock mode is enabled.
pub struct MockPath {
    pub generator: Arc<MockGenerator>,
    pub cache: Arc<MockStateCache>,
    /// Seed price for underlyings the walk has not seen yet.
    pub anchor_price: f64,
}

pub struct TickProcessor {
    validator: TickValidator,
    greeks: GreeksCalculator,
    clock: Arc<ExpiryClock>,
    batcher: Arc<TickBatcher>,
    sessions: Arc<SessionOrchestrator>,
    max_spot_age: Duration,
    mock: Option<MockPath>,

    /// Canonical underlying symbol → (last price, seen at).
    underlying_prices: RwLock<HashMap<String, (f64, DateTime<Utc>)>>,

    ticks_processed: AtomicU64,
    expired_skipped: AtomicU64,
    missing_underlying: AtomicU64,
    stale_underlying: AtomicU64,
    greeks_failures: AtomicU64,
    mock_emitted: AtomicU64,
}

impl TickProcessor {
    pub fn new(
        validator: TickValidator,
        greeks: GreeksCalculator,
        clock: Arc<ExpiryClock>,
        batcher: Arc<TickBatcher>,
        sessions: Arc<SessionOrchestrator>,
        max_spot_age_ms: u64,
        mock: Option<MockPath>,
    ) -> Self {
        Self {
            validator,
            greeks,
            clock,
            batcher,
            sessions,
            max_spot_age: Duration::milliseconds(max_spot_age_ms as i64),
            mock,
            underlying_prices: RwLock::new(HashMap::new()),
            ticks_processed: AtomicU64::new(0),
            expired_skipped: AtomicU64::new(0),
            missing_underlying: AtomicU64::new(0),
            stale_underlying: AtomicU64::new(0),
            greeks_failures: AtomicU64::new(0),
            mock_emitted: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> ProcessorCounters {
        ProcessorCounters {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_dropped: self.validator.dropped(),
            expired_skipped: self.expired_skipped.load(Ordering::Relaxed),
            missing_underlying: self.missing_underlying.load(Ordering::Relaxed),
            stale_underlying: self.stale_underlying.load(Ordering::Relaxed),
            greeks_failures: self.greeks_failures.load(Ordering::Relaxed),
            mock_emitted: self.mock_emitted.load(Ordering::Relaxed),
        }
    }

    /// Last known reference price for an underlying, if fresh enough.
    pub fn fresh_underlying_price(&self, symbol: &str, now: DateTime<Utc>) -> Option<f64> {
        let prices = self.underlying_prices.read();
        let (price, at) = prices.get(symbol)?;
        if now - *at > self.max_spot_age {
            return None;
        }
        Some(*price)
    }

    /// Process one raw batch for an account. Returns the number of ticks
    /// that made it through validation.
    pub fn process_batch(
        &self,
        account_id: &str,
        instruments: &HashMap<u32, Arc<Instrument>>,
        ticks: &[TickFrame],
        now: DateTime<Utc>,
    ) -> usize {
        let accepted = match self.validator.validate_batch(ticks, now) {
            Ok(accepted) => accepted,
            Err(e) => {
                // Strict mode: the batch is rejected wholesale.
                debug!(account = %account_id, error = %e, "tick batch aborted by validator");
                return 0;
            }
        };

        let today = self.clock.market_date(now);

        // First pass: in-batch OHLC aggregate per underlying symbol, so the
        // bar that survives the batcher's dedup carries the window's range.
        let mut window: HashMap<String, Ohlc> = HashMap::new();

        for tick in &accepted {
            let Some(instrument) = instruments.get(&tick.instrument_token) else {
                debug!(token = tick.instrument_token, "tick without instrument metadata — skipped");
                continue;
            };

            if instrument.is_expired(today) {
                self.expired_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if instrument.segment.is_underlying() {
                self.route_underlying(instrument, tick, &mut window);
            } else {
                self.route_option(instrument, tick, now);
            }
            self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        }

        self.sessions.record_tick(account_id, now);
        accepted.len()
    }

    fn route_underlying(
        &self,
        instrument: &Instrument,
        tick: &TickFrame,
        window: &mut HashMap<String, Ohlc>,
    ) {
        let symbol = normalize_symbol(&instrument.underlying_symbol);

        let agg = window
            .entry(symbol.clone())
            .and_modify(|o| {
                o.high = o.high.max(tick.last_price);
                o.low = o.low.min(tick.last_price);
                o.close = tick.last_price;
            })
            .or_insert(Ohlc {
                open: tick.last_price,
                high: tick.last_price,
                low: tick.last_price,
                close: tick.last_price,
            });
        let ohlc = *agg;

        self.underlying_prices
            .write()
            .insert(symbol.clone(), (tick.last_price, tick.timestamp));

        self.batcher.push_underlying(UnderlyingBar {
            symbol,
            last_price: tick.last_price,
            volume: tick.volume,
            ohlc: Some(ohlc),
            timestamp_ms: tick.timestamp.timestamp_millis(),
        });
    }

    fn route_option(&self, instrument: &Instrument, tick: &TickFrame, now: DateTime<Utc>) {
        let (Some(strike), Some(kind), Some(expiry)) = (
            instrument.strike,
            instrument.option_kind,
            instrument.expiry,
        ) else {
            debug!(token = instrument.instrument_token, "option tick missing contract fields");
            return;
        };

        let symbol = normalize_symbol(&instrument.underlying_symbol);

        let spot = {
            let prices = self.underlying_prices.read();
            prices.get(&symbol).copied()
        };

        let (spot, greeks) = match spot {
            None => {
                self.missing_underlying.fetch_add(1, Ordering::Relaxed);
                (None, None)
            }
            Some((_, at)) if now - at > self.max_spot_age => {
                self.stale_underlying.fetch_add(1, Ordering::Relaxed);
                (None, None)
            }
            Some((price, _)) => {
                let t = self.clock.year_fraction(expiry, now);
                match self.greeks.implied_vol(tick.last_price, price, strike, t, kind) {
                    IvOutcome::Converged { sigma, .. } => {
                        let greeks = self.greeks.greeks(price, strike, t, sigma, kind);
                        (Some(price), Some((sigma, greeks)))
                    }
                    outcome => {
                        self.greeks_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            token = instrument.instrument_token,
                            outcome = ?outcome,
                            "implied vol unavailable — emitting without greeks"
                        );
                        (Some(price), None)
                    }
                }
            }
        };

        let depth = tick
            .depth
            .as_ref()
            .map(NormalizedDepth::from_raw)
            .unwrap_or_else(NormalizedDepth::empty);

        let snapshot = OptionSnapshot {
            instrument_token: instrument.instrument_token,
            trading_symbol: instrument.trading_symbol.clone(),
            underlying_symbol: symbol,
            strike,
            option_type: kind,
            expiry_iso: expiry,
            last_price: tick.last_price,
            volume: tick.volume,
            oi: tick.oi.unwrap_or(0),
            iv: greeks.map(|(sigma, _)| sigma),
            delta: greeks.map(|(_, g)| g.delta),
            gamma: greeks.map(|(_, g)| g.gamma),
            theta: greeks.map(|(_, g)| g.theta),
            vega: greeks.map(|(_, g)| g.vega),
            spot,
            depth,
            timestamp_ms: tick.timestamp.timestamp_millis(),
        };

        self.batcher.push_option(snapshot);
    }

    /// Synthetic fallback for instruments with no live tick flow.
    ///
    /// Hard-gated: emits nothing unless mock mode was wired in, and never
    /// for an instrument whose segment is inside its live trading window.
    pub fn synthesize_idle(&self, instruments: &[Arc<Instrument>], now: DateTime<Utc>) -> usize {
        let Some(mock) = &self.mock else {
            return 0;
        };

        let today = self.clock.market_date(now);
        let mut emitted = 0usize;

        // Underlyings first so option quotes have a reference to price from.
        for instrument in instruments {
            if self.clock.is_market_open(instrument.segment, now) || instrument.is_expired(today) {
                continue;
            }
            if instrument.segment.is_underlying() {
                let quote = mock
                    .generator
                    .next_underlying(instrument, mock.anchor_price, today, now);
                let frame = TickFrame {
                    instrument_token: quote.instrument_token,
                    last_price: quote.last_price,
                    volume: quote.volume,
                    timestamp: quote.timestamp,
                    oi: None,
                    ohlc: None,
                    depth: None,
                };
                let mut window = HashMap::new();
                self.route_underlying(instrument, &frame, &mut window);
                emitted += 1;
            }
        }

        for instrument in instruments {
            if self.clock.is_market_open(instrument.segment, now) || instrument.is_expired(today) {
                continue;
            }
            if instrument.segment == Segment::Options {
                if let Some(quote) = mock.generator.next_option(instrument, today, now) {
                    let frame = TickFrame {
                        instrument_token: quote.instrument_token,
                        last_price: quote.last_price,
                        volume: quote.volume,
                        timestamp: quote.timestamp,
                        oi: quote.oi,
                        ohlc: None,
                        depth: None,
                    };
                    self.route_option(instrument, &frame, now);
                    emitted += 1;
                }
            }
        }

        if emitted > 0 {
            self.mock_emitted.fetch_add(emitted as u64, Ordering::Relaxed);
        }
        emitted
    }
}

/// Map exchange-decorated underlying names to their canonical root.
pub fn normalize_symbol(raw: &str) -> String {
    let stripped = raw
        .trim()
        .trim_start_matches("NSE:")
        .trim_start_matches("BSE:")
        .trim();

    match stripped {
        "NIFTY 50" => "NIFTY".to_string(),
        "NIFTY BANK" => "BANKNIFTY".to_string(),
        "NIFTY FIN SERVICE" => "FINNIFTY".to_string(),
        "NIFTY MID SELECT" => "MIDCPNIFTY".to_string(),
        "SENSEX" => "SENSEX".to_string(),
        other => other.replace(' ', ""),
    }
}

impl std::fmt::Debug for TickProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickProcessor")
            .field("counters", &self.counters())
            .finish()
    }
}
