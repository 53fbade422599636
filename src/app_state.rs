// =============================================================================
// Central Application State — Vega Options Nexus
// =============================================================================
//
// Every subsystem is constructed once in the composition root and handed
// here as an explicit dependency; nothing lives in module-level globals.
// The API layer holds an `Arc<AppState>` and reads health through the
// snapshot builder.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::broker::pool::PoolStats;
use crate::config::EngineConfig;
use crate::historical::HistoricalBootstrapper;
use crate::instruments::InstrumentRegistry;
use crate::orders::executor::ExecutorCounters;
use crate::orders::OrderExecutor;
use crate::publish::{RedisPublisher, TickBatcher};
use crate::session::SessionOrchestrator;
use crate::store::SubscriptionStore;
use crate::supervision::{BreakerState, TaskMonitor};
use crate::ticker::MultiAccountTickerLoop;
use crate::ticks::processor::ProcessorCounters;
use crate::ticks::TickProcessor;

/// Shared application state for the API layer and shutdown path.
pub struct AppState {
    pub config: EngineConfig,
    pub coordinator: Arc<MultiAccountTickerLoop>,
    pub executor: Arc<OrderExecutor>,
    /// Present when publishing goes to a real Redis; absent under test sinks.
    pub publisher: Option<Arc<RedisPublisher>>,
    pub store: SubscriptionStore,
    pub registry: Arc<InstrumentRegistry>,
    pub sessions: Arc<SessionOrchestrator>,
    pub processor: Arc<TickProcessor>,
    pub batcher: Arc<TickBatcher>,
    pub monitor: Arc<TaskMonitor>,
    pub start_time: Instant,
}

/// Health payload for `GET /api/v1/health` and the dashboard feed.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub server_time: i64,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_breaker: Option<BreakerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_published: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_dropped: Option<u64>,
    pub pools: Vec<PoolStats>,
    pub processor: ProcessorCounters,
    pub orders: ExecutorCounters,
    pub order_breakers: HashMap<String, BreakerState>,
    pub healthy_accounts: Vec<String>,
    pub instruments_cached: usize,
    pub reloads_executed: u64,
    pub batch_flushes: u64,
}

impl AppState {
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let degraded = matches!(
            self.publisher.as_ref().map(|p| p.breaker_state()),
            Some(BreakerState::Open)
        );

        HealthSnapshot {
            status: if degraded { "degraded" } else { "ok" },
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            redis_breaker: self.publisher.as_ref().map(|p| p.breaker_state()),
            redis_published: self.publisher.as_ref().map(|p| p.published()),
            redis_dropped: self.publisher.as_ref().map(|p| p.dropped()),
            pools: self.coordinator.pool_stats(),
            processor: self.processor.counters(),
            orders: self.executor.counters(),
            order_breakers: self.executor.breaker_states(),
            healthy_accounts: self.sessions.healthy_accounts(),
            instruments_cached: self.registry.len(),
            reloads_executed: self.coordinator.reloader().reloads_executed(),
            batch_flushes: self.batcher.flushes(),
        }
    }

    pub fn bootstrapper(&self) -> &Arc<HistoricalBootstrapper> {
        self.coordinator.bootstrapper()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}
