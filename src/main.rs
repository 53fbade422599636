// =============================================================================
// Vega Options Nexus — Main Entry Point
// =============================================================================
//
// Composition root: every subsystem is constructed here and handed to its
// consumers as an explicit dependency. The engine streams Kite Connect
// market data across multiple accounts, enriches option ticks with Greeks,
// and fans the result out over Redis pub/sub.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod config;
mod errors;
mod greeks;
mod historical;
mod instruments;
mod mock;
mod orders;
mod publish;
mod session;
mod store;
mod supervision;
mod ticker;
mod ticks;
mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::pool::BrokerConnectionPool;
use crate::broker::KiteHttpClient;
use crate::config::EngineConfig;
use crate::greeks::{ExpiryClock, GreeksCalculator};
use crate::historical::HistoricalBootstrapper;
use crate::instruments::InstrumentRegistry;
use crate::mock::{MockGenerator, MockStateCache};
use crate::orders::OrderExecutor;
use crate::publish::payloads::Channels;
use crate::publish::redis_publisher::MessageSink;
use crate::publish::{RedisPublisher, TickBatcher};
use crate::session::SessionOrchestrator;
use crate::store::{OrderTaskStore, SubscriptionStore};
use crate::supervision::TaskMonitor;
use crate::ticker::coordinator::PoolFactory;
use crate::ticker::MultiAccountTickerLoop;
use crate::ticks::processor::MockPath;
use crate::ticks::validator::ValidationMode;
use crate::ticks::{TickProcessor, TickValidator};

/// Seed price for mock underlying walks that have no live reference.
const MOCK_ANCHOR_PRICE: f64 = 24_500.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("VEGA_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Ok(url) = std::env::var("VEGA_REDIS_URL") {
        config.redis_url = url;
    }
    if let Ok(addr) = std::env::var("VEGA_BIND_ADDR") {
        config.bind_addr = addr;
    }
    // Convenience for single-account deployments: credentials via env.
    if let (Ok(account), Ok(api_key), Ok(token)) = (
        std::env::var("VEGA_ACCOUNT_ID"),
        std::env::var("KITE_API_KEY"),
        std::env::var("KITE_ACCESS_TOKEN"),
    ) {
        if let Some(existing) = config
            .accounts
            .iter_mut()
            .find(|a| a.account_id == account)
        {
            existing.api_key = api_key;
            existing.access_token = token;
        } else {
            config.accounts.push(crate::config::AccountConfig {
                account_id: account,
                api_key,
                access_token: token,
                enabled: true,
            });
        }
    }

    info!(
        accounts = config.accounts.len(),
        prefix = %config.publish_channel_prefix,
        mock = config.mock_data_enabled,
        "engine configuration ready"
    );

    // ── 2. Supervision & sessions ────────────────────────────────────────
    let monitor = TaskMonitor::new();
    let sessions = Arc::new(SessionOrchestrator::new(Duration::from_secs(
        config.lease_timeout_secs,
    )));
    let clock = Arc::new(ExpiryClock::new());

    // ── 3. Durable stores ────────────────────────────────────────────────
    let store = SubscriptionStore::open(&config.db_path)
        .context("failed to open subscription store")?;
    let task_store = OrderTaskStore::with_connection(store.connection())
        .context("failed to open order task store")?;

    // ── 4. Broker client & registry ──────────────────────────────────────
    let broker: Arc<KiteHttpClient> = Arc::new(KiteHttpClient::new(&config.accounts));
    let registry = Arc::new(InstrumentRegistry::new(
        broker.clone(),
        clock.clone(),
        Duration::from_secs(config.registry_staleness_secs),
    ));

    // ── 5. Publishing pipeline ───────────────────────────────────────────
    let publisher = Arc::new(
        RedisPublisher::connect(
            &config.redis_url,
            config.redis_pool_size,
            config.redis_circuit_failure_threshold,
            Duration::from_secs(config.redis_circuit_recovery_seconds),
        )
        .await
        .context("failed to connect redis publisher")?,
    );
    let sink: Arc<dyn MessageSink> = publisher.clone();
    let channels = Channels::new(&config.publish_channel_prefix);
    let batcher = TickBatcher::new(
        sink.clone(),
        channels,
        config.tick_batch_window_ms,
        config.tick_batch_max_size,
    );

    // ── 6. Tick processing ───────────────────────────────────────────────
    let mock_cache = if config.mock_data_enabled {
        Some(Arc::new(MockStateCache::new(config.mock_state_max_size)))
    } else {
        None
    };
    let mock_path = mock_cache.as_ref().map(|cache| MockPath {
        generator: Arc::new(MockGenerator::new(cache.clone())),
        cache: cache.clone(),
        anchor_price: MOCK_ANCHOR_PRICE,
    });

    let processor = Arc::new(TickProcessor::new(
        TickValidator::new(ValidationMode::Lenient),
        GreeksCalculator::new(config.risk_free_rate),
        clock.clone(),
        batcher.clone(),
        sessions.clone(),
        config.greeks_max_spot_age_ms,
        mock_path,
    ));

    // ── 7. Historical backfill & order executor ──────────────────────────
    let bootstrapper = Arc::new(HistoricalBootstrapper::new(
        broker.clone(),
        sessions.clone(),
        config.historical_backfill_days,
        config.historical_backfill_batch,
    ));

    let executor = Arc::new(OrderExecutor::new(
        broker.clone(),
        sessions.clone(),
        task_store,
        config.order_executor_max_tasks,
        config.order_executor_max_attempts,
        config.order_executor_poll_interval_ms,
        config.order_idempotency_window_secs,
    ));
    let recovered = executor.recover().unwrap_or(0);
    if recovered > 0 {
        info!(recovered, "order tasks re-adopted from a previous run");
    }
    monitor.spawn("order-executor", {
        let executor = executor.clone();
        async move { executor.run().await }
    });

    // ── 8. Coordinator ───────────────────────────────────────────────────
    let cap = config.max_instruments_per_ws_connection;
    let factory_monitor = monitor.clone();
    let pool_factory: PoolFactory = Arc::new(
        move |account: &crate::config::AccountConfig,
              tick_tx: mpsc::Sender<Vec<crate::ticks::frames::TickFrame>>| {
            Arc::new(BrokerConnectionPool::new(
                account.account_id.clone(),
                &account.api_key,
                &account.access_token,
                cap,
                tick_tx,
                factory_monitor.clone(),
            ))
        },
    );

    let coordinator = MultiAccountTickerLoop::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        sessions.clone(),
        monitor.clone(),
        batcher.clone(),
        processor.clone(),
        bootstrapper,
        sink,
        pool_factory,
        mock_cache,
    );

    coordinator.clone().start().await.context("ticker loop failed to start")?;

    // ── 9. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: config.clone(),
        coordinator: coordinator.clone(),
        executor: executor.clone(),
        publisher: Some(publisher),
        store,
        registry,
        sessions,
        processor,
        batcher,
        monitor: monitor.clone(),
        start_time: Instant::now(),
    });

    let bind_addr = config.bind_addr.clone();
    monitor.spawn("api-server", {
        let state = state.clone();
        async move {
            let app = api::rest::router(state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?;
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app)
                .await
                .context("API server failed")
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    coordinator.stop().await;
    state.executor.stop();
    monitor.cancel_all();

    info!("vega nexus shut down complete");
    Ok(())
}
