// =============================================================================
// Synthetic market data — bounded state cache and generators
// =============================================================================
//
// Development/testing fallback for subscribed instruments when the market
// is closed. Never active in production while a live session is open.
// =============================================================================

pub mod cache;
pub mod generator;

pub use cache::MockStateCache;
pub use generator::{MockGenerator, MockQuote};
