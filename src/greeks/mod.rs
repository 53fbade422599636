// =============================================================================
// Options pricing — Black–Scholes, implied volatility, market-hours clock
// =============================================================================

pub mod black_scholes;
pub mod expiry;

pub use black_scholes::{Greeks, GreeksCalculator, IvOutcome};
pub use expiry::ExpiryClock;
