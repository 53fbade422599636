// =============================================================================
// Broker HTTP client — instruments dump, historical candles, order calls
// =============================================================================
//
// The `BrokerApi` trait is the seam between the engine and the broker's
// REST surface; the live implementation speaks the Kite Connect v3
// conventions. Token bootstrap is out of scope: access tokens arrive via
// configuration and are passed per request.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AccountConfig;
use crate::errors::ServiceError;
use crate::types::{Instrument, OptionKind, OrderOperation, Segment};

const KITE_BASE_URL: &str = "https://api.kite.trade";
const KITE_VERSION: &str = "3";

/// One historical candle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub oi: Option<u64>,
}

/// Broker REST surface consumed by the engine.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Full instrument dump (the broker publishes one per day).
    async fn fetch_instruments(&self) -> Result<Vec<Instrument>>;

    /// Day candles for one instrument over a date range.
    async fn fetch_candles(
        &self,
        account_id: &str,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>>;

    /// Execute one order operation. Classified errors drive the executor's
    /// retry/breaker decisions.
    async fn execute_order(
        &self,
        account_id: &str,
        operation: OrderOperation,
        params: &Value,
    ) -> Result<Value, ServiceError>;
}

// =============================================================================
// Live Kite Connect client
// =============================================================================

pub struct KiteHttpClient {
    http: reqwest::Client,
    base_url: String,
    /// account_id → credentials.
    accounts: HashMap<String, AccountConfig>,
}

impl KiteHttpClient {
    pub fn new(accounts: &[AccountConfig]) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: KITE_BASE_URL.to_string(),
            accounts: accounts
                .iter()
                .map(|a| (a.account_id.clone(), a.clone()))
                .collect(),
        }
    }

    fn auth_header(&self, account_id: &str) -> Result<String, ServiceError> {
        let account = self.accounts.get(account_id).ok_or_else(|| {
            ServiceError::NotFound(format!("no credentials for account {account_id}"))
        })?;
        Ok(format!(
            "token {}:{}",
            account.api_key, account.access_token
        ))
    }

    /// Any configured account can fetch the shared instrument dump.
    fn any_auth_header(&self) -> Result<String> {
        let account = self
            .accounts
            .values()
            .next()
            .context("no broker accounts configured")?;
        Ok(format!(
            "token {}:{}",
            account.api_key, account.access_token
        ))
    }
}

#[async_trait]
impl BrokerApi for KiteHttpClient {
    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let auth = self.any_auth_header()?;
        let url = format!("{}/instruments", self.base_url);

        let body = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .context("instrument dump request failed")?
            .error_for_status()
            .context("instrument dump returned error status")?
            .text()
            .await
            .context("failed to read instrument dump body")?;

        let instruments = parse_instrument_dump(&body);
        info!(count = instruments.len(), "instrument dump fetched");
        Ok(instruments)
    }

    async fn fetch_candles(
        &self,
        account_id: &str,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>> {
        let auth = self
            .auth_header(account_id)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let url = format!(
            "{}/instruments/historical/{}/day?from={}&to={}",
            self.base_url, instrument_token, from, to
        );

        let body: Value = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .context("historical candle request failed")?
            .error_for_status()
            .context("historical candle request returned error status")?
            .json()
            .await
            .context("failed to parse candle response")?;

        let mut candles = Vec::new();
        if let Some(rows) = body
            .get("data")
            .and_then(|d| d.get("candles"))
            .and_then(|c| c.as_array())
        {
            for row in rows {
                if let Some(candle) = parse_candle_row(row) {
                    candles.push(candle);
                } else {
                    debug!(token = instrument_token, "skipping malformed candle row");
                }
            }
        }
        Ok(candles)
    }

    async fn execute_order(
        &self,
        account_id: &str,
        operation: OrderOperation,
        params: &Value,
    ) -> Result<Value, ServiceError> {
        let auth = self.auth_header(account_id)?;

        let order_id = params.get("order_id").and_then(|v| v.as_str());
        let (method, path) = match operation {
            OrderOperation::Place => (reqwest::Method::POST, "/orders/regular".to_string()),
            OrderOperation::Modify => {
                let id = order_id.ok_or_else(|| {
                    ServiceError::Validation("modify requires order_id".into())
                })?;
                (reqwest::Method::PUT, format!("/orders/regular/{id}"))
            }
            OrderOperation::Cancel => {
                let id = order_id.ok_or_else(|| {
                    ServiceError::Validation("cancel requires order_id".into())
                })?;
                (reqwest::Method::DELETE, format!("/orders/regular/{id}"))
            }
            OrderOperation::Exit => (reqwest::Method::POST, "/orders/regular".to_string()),
        };

        let form: Vec<(String, String)> = params
            .as_object()
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.as_str() != "order_id")
                    .map(|(k, v)| {
                        let val = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), val)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let response = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", auth)
            .form(&form)
            .send()
            .await
            .map_err(|e| ServiceError::Transient(format!("order request failed: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Transient(format!("order response unreadable: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("order rejected")
                .to_string();
            let err = match status.as_u16() {
                401 | 403 => ServiceError::Auth {
                    account: account_id.to_string(),
                    reason: message,
                },
                429 => ServiceError::RateLimited(message),
                400 => ServiceError::Validation(message),
                _ => ServiceError::Transient(message),
            };
            warn!(account = account_id, op = %operation, error = %err, "order call failed");
            Err(err)
        }
    }
}

// =============================================================================
// Dump and candle parsing
// =============================================================================

/// Parse the broker's CSV instrument dump.
///
/// Columns: instrument_token, exchange_token, tradingsymbol, name,
/// last_price, expiry, strike, tick_size, lot_size, instrument_type,
/// segment, exchange.
pub fn parse_instrument_dump(csv: &str) -> Vec<Instrument> {
    let mut out = Vec::new();
    for (line_no, line) in csv.lines().enumerate() {
        if line_no == 0 || line.trim().is_empty() {
            continue; // header
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 12 {
            continue;
        }

        let token: u32 = match fields[0].trim().parse() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let trading_symbol = fields[2].trim().to_string();
        let name = fields[3].trim().trim_matches('"').to_string();
        let expiry = NaiveDate::parse_from_str(fields[5].trim(), "%Y-%m-%d").ok();
        let strike: f64 = fields[6].trim().parse().unwrap_or(0.0);
        let tick_size: f64 = fields[7].trim().parse().unwrap_or(0.05);
        let lot_size: u32 = fields[8].trim().parse().unwrap_or(1);
        let instrument_type = fields[9].trim();
        let segment_raw = fields[10].trim();
        let exchange = fields[11].trim().to_string();

        let segment = if segment_raw == "INDICES" {
            Segment::Index
        } else if segment_raw.ends_with("-FUT") {
            Segment::Futures
        } else if segment_raw.ends_with("-OPT") {
            Segment::Options
        } else {
            Segment::Equity
        };

        let option_kind = match instrument_type {
            "CE" => Some(OptionKind::Call),
            "PE" => Some(OptionKind::Put),
            _ => None,
        };

        let underlying_symbol = if name.is_empty() {
            trading_symbol.clone()
        } else {
            name.clone()
        };

        out.push(Instrument {
            instrument_token: token,
            exchange,
            trading_symbol,
            segment,
            expiry,
            strike: if segment == Segment::Options {
                Some(strike)
            } else {
                None
            },
            option_kind,
            lot_size,
            tick_size,
            underlying_symbol,
        });
    }
    out
}

fn parse_candle_row(row: &Value) -> Option<Candle> {
    let arr = row.as_array()?;
    let ts = arr.first()?.as_str()?;
    let timestamp = DateTime::parse_from_rfc3339(ts)
        .ok()?
        .with_timezone(&Utc);
    Some(Candle {
        timestamp,
        open: arr.get(1)?.as_f64()?,
        high: arr.get(2)?.as_f64()?,
        low: arr.get(3)?.as_f64()?,
        close: arr.get(4)?.as_f64()?,
        volume: arr.get(5)?.as_u64()?,
        oi: arr.get(6).and_then(|v| v.as_u64()),
    })
}

impl std::fmt::Debug for KiteHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteHttpClient")
            .field("base_url", &self.base_url)
            .field("accounts", &self.accounts.keys().collect::<Vec<_>>())
            .finish()
    }
}


// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
256265,1001,NIFTY 50,NIFTY 50,0,,0,0.05,1,EQ,INDICES,NSE
12602370,49228,NIFTY25NOVFUT,NIFTY,0,2025-11-27,0,0.05,50,FUT,NFO-FUT,NFO
12683010,49543,NIFTY25NOV24500CE,NIFTY,0,2025-11-25,24500,0.05,50,CE,NFO-OPT,NFO
12683266,49544,NIFTY25NOV24500PE,NIFTY,0,2025-11-25,24500,0.05,50,PE,NFO-OPT,NFO
738561,2885,RELIANCE,RELIANCE,0,,0,0.05,1,EQ,NSE,NSE
";

    #[test]
    fn dump_parses_all_segments() {
        let instruments = parse_instrument_dump(DUMP);
        assert_eq!(instruments.len(), 5);

        let index = &instruments[0];
        assert_eq!(index.segment, Segment::Index);
        assert_eq!(index.instrument_token, 256265);
        assert!(index.expiry.is_none());

        let future = &instruments[1];
        assert_eq!(future.segment, Segment::Futures);
        assert_eq!(future.underlying_symbol, "NIFTY");
        assert_eq!(future.lot_size, 50);

        let call = &instruments[2];
        assert_eq!(call.segment, Segment::Options);
        assert_eq!(call.option_kind, Some(OptionKind::Call));
        assert_eq!(call.strike, Some(24_500.0));
        assert_eq!(
            call.expiry,
            NaiveDate::from_ymd_opt(2025, 11, 25)
        );

        let equity = &instruments[4];
        assert_eq!(equity.segment, Segment::Equity);
        assert!(equity.option_kind.is_none());
    }

    #[test]
    fn malformed_dump_lines_are_skipped() {
        let dump = "header\nnot,enough,fields\ngarbage-token,x,S,N,0,,0,0.05,1,EQ,NSE,NSE\n";
        assert!(parse_instrument_dump(dump).is_empty());
    }

    #[test]
    fn candle_rows_parse() {
        let row = serde_json::json!([
            "2025-11-24T09:15:00+05:30",
            24500.0,
            24550.0,
            24480.0,
            24520.0,
            125000,
            0
        ]);
        let candle = parse_candle_row(&row).unwrap();
        assert_eq!(candle.open, 24_500.0);
        assert_eq!(candle.volume, 125_000);

        assert!(parse_candle_row(&serde_json::json!(["bad-date", 1, 2, 3, 4, 5])).is_none());
    }
}
