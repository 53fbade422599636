// =============================================================================
// Shared types used across the Vega ticker engine
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Exchange segment an instrument trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Index,
    Futures,
    Options,
    Equity,
}

impl Segment {
    /// True for segments that act as an underlying reference for option
    /// pricing (everything except the options segment itself).
    pub fn is_underlying(&self) -> bool {
        !matches!(self, Self::Options)
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Futures => write!(f, "futures"),
            Self::Options => write!(f, "options"),
            Self::Equity => write!(f, "equity"),
        }
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionKind {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

/// Broker tick detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    Ltp,
    Quote,
    Full,
}

impl TickMode {
    /// Wire word used in broker WebSocket mode frames.
    pub fn wire_word(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for TickMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_word())
    }
}

impl std::str::FromStr for TickMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ltp" => Ok(Self::Ltp),
            "quote" => Ok(Self::Quote),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown tick mode: {other}")),
        }
    }
}

/// Whether a stored subscription should be streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Instrument metadata as loaded from the broker's daily dump.
///
/// Immutable per identity within a trading day; owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub exchange: String,
    pub trading_symbol: String,
    pub segment: Segment,
    /// Expiry date for derivatives; `None` for equity and index instruments.
    pub expiry: Option<NaiveDate>,
    /// Strike price; only meaningful for options.
    pub strike: Option<f64>,
    pub option_kind: Option<OptionKind>,
    pub lot_size: u32,
    pub tick_size: f64,
    /// Canonical root symbol of the underlying (e.g. "NIFTY").
    pub underlying_symbol: String,
}

impl Instrument {
    /// True once the instrument's expiry date is strictly before `today`.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        matches!(self.expiry, Some(exp) if exp < today)
    }
}

/// One stored row of subscription intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub instrument_token: u32,
    pub requested_mode: TickMode,
    pub status: SubscriptionStatus,
    pub assigned_account_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Broker order operation carried by an execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOperation {
    Place,
    Modify,
    Cancel,
    Exit,
}

impl std::fmt::Display for OrderOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Place => write!(f, "place"),
            Self::Modify => write!(f, "modify"),
            Self::Cancel => write!(f, "cancel"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

impl std::str::FromStr for OrderOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "place" => Ok(Self::Place),
            "modify" => Ok(Self::Modify),
            "cancel" => Ok(Self::Cancel),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unknown order operation: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_mode_round_trips_through_wire_word() {
        for mode in [TickMode::Ltp, TickMode::Quote, TickMode::Full] {
            assert_eq!(mode.wire_word().parse::<TickMode>().unwrap(), mode);
        }
    }

    #[test]
    fn option_kind_serializes_as_broker_codes() {
        assert_eq!(serde_json::to_string(&OptionKind::Call).unwrap(), "\"CE\"");
        assert_eq!(serde_json::to_string(&OptionKind::Put).unwrap(), "\"PE\"");
    }

    #[test]
    fn expired_only_strictly_before_today() {
        let today = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap();
        let mut inst = Instrument {
            instrument_token: 1,
            exchange: "NFO".into(),
            trading_symbol: "NIFTY25NOV24500CE".into(),
            segment: Segment::Options,
            expiry: Some(today),
            strike: Some(24_500.0),
            option_kind: Some(OptionKind::Call),
            lot_size: 50,
            tick_size: 0.05,
            underlying_symbol: "NIFTY".into(),
        };
        assert!(!inst.is_expired(today));
        inst.expiry = Some(today.pred_opt().unwrap());
        assert!(inst.is_expired(today));
        inst.expiry = None;
        assert!(!inst.is_expired(today));
    }
}
