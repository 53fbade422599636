// =============================================================================
// Publishing — channel payloads, Redis fan-out, time/size-bounded batching
// =============================================================================

pub mod batcher;
pub mod payloads;
pub mod redis_publisher;

pub use batcher::TickBatcher;
pub use payloads::{Channels, SubscriptionEvent, SubscriptionEventType};
pub use redis_publisher::{MessageSink, RedisPublisher};
