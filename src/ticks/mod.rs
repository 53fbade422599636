// =============================================================================
// Tick pipeline — raw frames, validation, routing, Greeks enrichment
// =============================================================================

pub mod frames;
pub mod processor;
pub mod validator;

pub use frames::{DepthLevel, MarketDepth, NormalizedDepth, Ohlc, OptionSnapshot, TickFrame, UnderlyingBar};
pub use processor::TickProcessor;
pub use validator::{TickValidator, ValidationMode};
