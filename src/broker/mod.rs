// =============================================================================
// Broker connectivity — HTTP API, WebSocket wire codec, pooled connections
// =============================================================================

pub mod client;
pub mod pool;
pub mod wire;
pub mod ws;

pub use client::{BrokerApi, Candle, KiteHttpClient};
pub use pool::{BrokerConnectionPool, ConnectionStats, PoolStats};
