// =============================================================================
// Order execution — reliable task queue over the broker API
// =============================================================================

pub mod executor;

pub use executor::OrderExecutor;
