// =============================================================================
// Expiry Clock — time-to-expiry as integrated IST market minutes
// =============================================================================
//
// Time-to-expiry excludes weekends and non-market hours: T is the number of
// trading minutes between now and the expiry close (15:30 IST on the expiry
// date), expressed as a fraction of a 365-day year of trading minutes.
// Values are cached per (expiry, current minute) since ticks for the same
// option chain arrive thousands of times per minute.
// =============================================================================

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::types::Segment;

/// IST never observes DST; a fixed +05:30 offset is exact.
pub fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("+05:30 is a valid offset")
}

/// Equity/derivatives session open.
pub const MARKET_OPEN: (u32, u32) = (9, 15);
/// Equity/derivatives session close; also the expiry cut-off.
pub const MARKET_CLOSE: (u32, u32) = (15, 30);
/// Derivative sessions extend past the equity close; currency products
/// trade until 17:00 IST.
const DERIVATIVES_CLOSE: (u32, u32) = (17, 0);

/// Trading minutes in one session (09:15–15:30).
const MINUTES_PER_DAY: i64 = 375;
/// Trading minutes in the 365-day pricing year.
const MINUTES_PER_YEAR: f64 = 365.0 * MINUTES_PER_DAY as f64;

fn time_of(hm: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("session boundary is a valid time")
}

fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Trading minutes remaining between `now` (IST) and the close of `expiry`.
fn market_minutes_until_close(now: DateTime<FixedOffset>, expiry: NaiveDate) -> i64 {
    let today = now.date_naive();
    if expiry < today {
        return 0;
    }

    let open = time_of(MARKET_OPEN);
    let close = time_of(MARKET_CLOSE);
    let mut total = 0i64;

    let mut day = today;
    while day <= expiry {
        if is_trading_day(day) {
            // Session window clipped by `now` on the current day.
            let start = if day == today {
                now.time().max(open)
            } else {
                open
            };
            if start < close {
                total += (close - start).num_minutes();
            }
        }
        day = match day.succ_opt() {
            Some(d) => d,
            None => break,
        };
    }

    total.max(0)
}

/// Cached market-minutes clock.
pub struct ExpiryClock {
    ist: FixedOffset,
    /// (minute epoch the cache was built for, expiry → year fraction).
    cache: Mutex<(i64, HashMap<NaiveDate, f64>)>,
}

impl ExpiryClock {
    pub fn new() -> Self {
        Self {
            ist: ist_offset(),
            cache: Mutex::new((0, HashMap::new())),
        }
    }

    /// Year fraction until expiry close, from `now`.
    ///
    /// Zero strictly at and beyond the 15:30 IST close on the expiry date.
    pub fn year_fraction(&self, expiry: NaiveDate, now: DateTime<Utc>) -> f64 {
        let now_ist = now.with_timezone(&self.ist);
        let minute_key = now.timestamp() / 60;

        let mut cache = self.cache.lock();
        if cache.0 != minute_key {
            // New minute: every cached fraction is stale.
            cache.0 = minute_key;
            cache.1.clear();
        }
        if let Some(&t) = cache.1.get(&expiry) {
            return t;
        }

        let minutes = market_minutes_until_close(now_ist, expiry);
        let t = minutes as f64 / MINUTES_PER_YEAR;
        cache.1.insert(expiry, t);
        t
    }

    /// Today's market date in IST. Used for expiry pruning: an instrument
    /// expiring before this date is dead.
    pub fn market_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.ist).date_naive()
    }

    /// Whether `segment` is inside its live trading window at `now`.
    ///
    /// Currency and commodity segments trade past the 15:30 equity close;
    /// the mock-data gate must respect the extended windows so synthetic
    /// values never overlap a live session.
    pub fn is_market_open(&self, segment: Segment, now: DateTime<Utc>) -> bool {
        let now_ist = now.with_timezone(&self.ist);
        if !is_trading_day(now_ist.date_naive()) {
            return false;
        }
        let t = now_ist.time();
        let close = match segment {
            Segment::Index | Segment::Equity => time_of(MARKET_CLOSE),
            // Futures/options get the longest applicable window so mock
            // data can never overlap an extended live session.
            Segment::Futures | Segment::Options => time_of(DERIVATIVES_CLOSE),
        };
        t >= time_of(MARKET_OPEN) && t < close
    }
}

impl Default for ExpiryClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used by the historical bootstrapper: the last `n` trading
/// days ending today (IST).
pub fn last_market_days(now: DateTime<Utc>, n: u32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n as usize);
    let mut day = now.with_timezone(&ist_offset()).date_naive();
    while days.len() < n as usize {
        if is_trading_day(day) {
            days.push(day);
        }
        day = match day.checked_sub_signed(ChronoDuration::days(1)) {
            Some(d) => d,
            None => break,
        };
    }
    days.reverse();
    days
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a UTC instant from IST wall-clock parts.
    fn utc_from_ist(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        ist_offset()
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn zero_at_expiry_close() {
        let clock = ExpiryClock::new();
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap(); // Tuesday
        let at_close = utc_from_ist(2025, 11, 25, 15, 30);
        assert_eq!(clock.year_fraction(expiry, at_close), 0.0);

        let past_close = utc_from_ist(2025, 11, 25, 16, 0);
        assert_eq!(clock.year_fraction(expiry, past_close), 0.0);
    }

    #[test]
    fn one_full_session_on_expiry_morning() {
        let clock = ExpiryClock::new();
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap();
        let at_open = utc_from_ist(2025, 11, 25, 9, 15);
        let t = clock.year_fraction(expiry, at_open);
        let expected = 375.0 / (365.0 * 375.0);
        assert!((t - expected).abs() < 1e-12);
    }

    #[test]
    fn weekend_contributes_nothing() {
        let clock = ExpiryClock::new();
        // Friday 2025-11-21 at open, expiring Monday 2025-11-24:
        // Friday session + Monday session, Saturday/Sunday skipped.
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 24).unwrap();
        let friday_open = utc_from_ist(2025, 11, 21, 9, 15);
        let t = clock.year_fraction(expiry, friday_open);
        let expected = 2.0 * 375.0 / (365.0 * 375.0);
        assert!((t - expected).abs() < 1e-12);
    }

    #[test]
    fn pre_open_counts_the_full_day() {
        let clock = ExpiryClock::new();
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap();
        let before_open = utc_from_ist(2025, 11, 25, 7, 0);
        let at_open = utc_from_ist(2025, 11, 25, 9, 15);
        assert_eq!(
            clock.year_fraction(expiry, before_open),
            clock.year_fraction(expiry, at_open)
        );
    }

    #[test]
    fn cache_is_per_minute() {
        let clock = ExpiryClock::new();
        let expiry = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap();
        let now = utc_from_ist(2025, 11, 24, 10, 0);
        let first = clock.year_fraction(expiry, now);
        // Same minute: served from cache, identical value.
        let again = clock.year_fraction(expiry, now + ChronoDuration::seconds(30));
        assert_eq!(first, again);
        // Next minute: one trading minute less.
        let next = clock.year_fraction(expiry, now + ChronoDuration::minutes(1));
        assert!(next < first);
    }

    #[test]
    fn equity_window_closes_at_1530() {
        let clock = ExpiryClock::new();
        assert!(clock.is_market_open(Segment::Equity, utc_from_ist(2025, 11, 24, 12, 0)));
        assert!(!clock.is_market_open(Segment::Equity, utc_from_ist(2025, 11, 24, 16, 0)));
        // Derivatives stay open past the equity close.
        assert!(clock.is_market_open(Segment::Options, utc_from_ist(2025, 11, 24, 16, 0)));
        // Nothing trades on Saturday.
        assert!(!clock.is_market_open(Segment::Options, utc_from_ist(2025, 11, 22, 12, 0)));
    }

    #[test]
    fn last_market_days_skips_weekends() {
        // Monday 2025-11-24: previous 3 market days are Thu, Fri, Mon.
        let days = last_market_days(utc_from_ist(2025, 11, 24, 12, 0), 3);
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2025, 11, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 11, 21).unwrap(),
                NaiveDate::from_ymd_opt(2025, 11, 24).unwrap(),
            ]
        );
    }
}
