// =============================================================================
// Tick data model — raw frames in, enriched snapshots out
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::OptionKind;

/// One level of market depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u32,
    pub orders: u32,
}

/// Raw depth as decoded from the wire; may carry fewer than five levels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
}

/// Depth normalized to exactly five levels per side, null-filled when the
/// wire supplied fewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDepth {
    pub buy: [Option<DepthLevel>; 5],
    pub sell: [Option<DepthLevel>; 5],
}

impl NormalizedDepth {
    pub fn empty() -> Self {
        Self {
            buy: [None; 5],
            sell: [None; 5],
        }
    }

    /// Normalize raw wire depth: first five levels per side, missing levels
    /// null-filled.
    pub fn from_raw(raw: &MarketDepth) -> Self {
        let mut out = Self::empty();
        for (slot, level) in out.buy.iter_mut().zip(raw.buy.iter()) {
            *slot = Some(*level);
        }
        for (slot, level) in out.sell.iter_mut().zip(raw.sell.iter()) {
            *slot = Some(*level);
        }
        out
    }
}

/// Day open/high/low/close as carried in quote-mode packets, and the
/// window aggregate emitted on underlying bars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One raw market-data update for one instrument, straight off the wire.
/// Transient; lives only through the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct TickFrame {
    pub instrument_token: u32,
    pub last_price: f64,
    pub volume: u64,
    /// Broker (exchange) timestamp.
    pub timestamp: DateTime<Utc>,
    pub oi: Option<u64>,
    pub ohlc: Option<Ohlc>,
    pub depth: Option<MarketDepth>,
}

/// Aggregated underlying update emitted to the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingBar {
    pub symbol: String,
    pub last_price: f64,
    pub volume: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    pub timestamp_ms: i64,
}

/// Option tick after Greeks enrichment. Greeks fields are absent when the
/// solve failed or the underlying reference was missing or stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub underlying_symbol: String,
    pub strike: f64,
    pub option_type: OptionKind,
    pub expiry_iso: NaiveDate,
    pub last_price: f64,
    pub volume: u64,
    pub oi: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    /// Underlying reference price used for the Greeks solve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spot: Option<f64>,
    pub depth: NormalizedDepth,
    pub timestamp_ms: i64,
}

impl OptionSnapshot {
    pub fn has_greeks(&self) -> bool {
        self.iv.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64) -> DepthLevel {
        DepthLevel {
            price,
            quantity: 50,
            orders: 1,
        }
    }

    #[test]
    fn depth_null_fills_missing_levels() {
        let raw = MarketDepth {
            buy: vec![level(100.0), level(99.95)],
            sell: vec![level(100.05)],
        };
        let norm = NormalizedDepth::from_raw(&raw);
        assert_eq!(norm.buy.iter().flatten().count(), 2);
        assert_eq!(norm.sell.iter().flatten().count(), 1);
        assert!(norm.buy[2].is_none());
        assert!(norm.sell[4].is_none());
    }

    #[test]
    fn depth_truncates_beyond_five() {
        let raw = MarketDepth {
            buy: (0..7).map(|i| level(100.0 - i as f64 * 0.05)).collect(),
            sell: Vec::new(),
        };
        let norm = NormalizedDepth::from_raw(&raw);
        assert_eq!(norm.buy.iter().flatten().count(), 5);
    }

    #[test]
    fn option_snapshot_round_trips_through_json() {
        let snap = OptionSnapshot {
            instrument_token: 12_345_678,
            trading_symbol: "NIFTY25NOV24500CE".into(),
            underlying_symbol: "NIFTY".into(),
            strike: 24_500.0,
            option_type: OptionKind::Call,
            expiry_iso: NaiveDate::from_ymd_opt(2025, 11, 25).unwrap(),
            last_price: 182.4,
            volume: 1_250_000,
            oi: 3_400_000,
            iv: Some(0.1812),
            delta: Some(0.52),
            gamma: Some(0.0009),
            theta: Some(-9.4),
            vega: Some(11.2),
            spot: Some(24_512.5),
            depth: NormalizedDepth::empty(),
            timestamp_ms: 1_763_960_400_000,
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: OptionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        // Re-encoding is byte-exact once normalized.
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn absent_greeks_are_omitted_from_json() {
        let snap = OptionSnapshot {
            instrument_token: 1,
            trading_symbol: "X".into(),
            underlying_symbol: "X".into(),
            strike: 1.0,
            option_type: OptionKind::Put,
            expiry_iso: NaiveDate::from_ymd_opt(2025, 11, 25).unwrap(),
            last_price: 1.0,
            volume: 0,
            oi: 0,
            iv: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            spot: None,
            depth: NormalizedDepth::empty(),
            timestamp_ms: 0,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("\"iv\""));
        assert!(!json.contains("\"delta\""));
    }
}
