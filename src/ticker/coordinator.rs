// =============================================================================
// Multi-Account Ticker Loop — reconcile → assign → stream → supervise
// =============================================================================
//
// The top-level coordinator. `start` loads subscription intent, prunes
// what the registry no longer recognizes, round-robins the survivors over
// healthy accounts, and brings up one streaming pipeline per account
// (bootstrap → pool subscribe → tick receive loop), all under the task
// monitor. Reloads are debounced and applied as a subscribe/unsubscribe
// diff against each account's pool — streams are never restarted for a
// reload. `start` is idempotent; `stop` tears down in reverse order.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::pool::{BrokerConnectionPool, PoolStats};
use crate::config::{AccountConfig, EngineConfig};
use crate::historical::HistoricalBootstrapper;
use crate::instruments::InstrumentRegistry;
use crate::mock::MockStateCache;
use crate::publish::payloads::{Channels, SubscriptionEvent, SubscriptionEventType};
use crate::publish::redis_publisher::MessageSink;
use crate::publish::TickBatcher;
use crate::session::SessionOrchestrator;
use crate::store::SubscriptionStore;
use crate::supervision::{SubscriptionReloader, TaskMonitor};
use crate::ticker::assignment::{diff_tokens, round_robin};
use crate::ticks::frames::TickFrame;
use crate::ticks::TickProcessor;
use crate::types::{Instrument, TickMode};

/// Per-account tick channel depth. Broker callbacks buffer here while the
/// processor catches up.
const TICK_CHANNEL_DEPTH: usize = 1024;
/// Mock pump cadence while the market is closed.
const MOCK_PUMP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Mock cache sweep cadence.
const MOCK_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Builds one pool per account; swapped for an offline builder in tests.
pub type PoolFactory = Arc<
    dyn Fn(&AccountConfig, mpsc::Sender<Vec<TickFrame>>) -> Arc<BrokerConnectionPool>
        + Send
        + Sync,
>;

struct AccountRuntime {
    pool: Arc<BrokerConnectionPool>,
}

struct Plan {
    assignments: HashMap<String, Vec<Arc<Instrument>>>,
    resolved: HashMap<u32, Arc<Instrument>>,
    modes: HashMap<u32, TickMode>,
    prev_accounts: HashMap<u32, Option<String>>,
    pruned: Vec<u32>,
}

pub struct MultiAccountTickerLoop {
    config: EngineConfig,
    store: SubscriptionStore,
    registry: Arc<InstrumentRegistry>,
    sessions: Arc<SessionOrchestrator>,
    monitor: Arc<TaskMonitor>,
    batcher: Arc<TickBatcher>,
    processor: Arc<TickProcessor>,
    bootstrapper: Arc<HistoricalBootstrapper>,
    reloader: Arc<SubscriptionReloader>,
    sink: Arc<dyn MessageSink>,
    channels: Channels,
    pool_factory: PoolFactory,
    mock_cache: Option<Arc<MockStateCache>>,

    /// token → instrument for the streaming tasks' lookups.
    resolved: Arc<RwLock<HashMap<u32, Arc<Instrument>>>>,
    runtimes: Mutex<HashMap<String, AccountRuntime>>,
    started: AtomicBool,
}

impl MultiAccountTickerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: SubscriptionStore,
        registry: Arc<InstrumentRegistry>,
        sessions: Arc<SessionOrchestrator>,
        monitor: Arc<TaskMonitor>,
        batcher: Arc<TickBatcher>,
        processor: Arc<TickProcessor>,
        bootstrapper: Arc<HistoricalBootstrapper>,
        sink: Arc<dyn MessageSink>,
        pool_factory: PoolFactory,
        mock_cache: Option<Arc<MockStateCache>>,
    ) -> Arc<Self> {
        let channels = Channels::new(&config.publish_channel_prefix);
        let reloader = SubscriptionReloader::new(
            config.reload_debounce_ms,
            config.reload_max_debounce_ms,
            config.reload_min_gap_ms,
        );

        for account in &config.accounts {
            if account.enabled {
                sessions.register_account(&account.account_id);
            }
        }

        Arc::new(Self {
            config,
            store,
            registry,
            sessions,
            monitor,
            batcher,
            processor,
            bootstrapper,
            reloader,
            sink,
            channels,
            pool_factory,
            mock_cache,
            resolved: Arc::new(RwLock::new(HashMap::new())),
            runtimes: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn reloader(&self) -> &Arc<SubscriptionReloader> {
        &self.reloader
    }

    pub fn bootstrapper(&self) -> &Arc<HistoricalBootstrapper> {
        &self.bootstrapper
    }

    /// Non-blocking reload request; bursts coalesce in the reloader.
    pub fn reload(&self) {
        self.reloader.trigger();
    }

    /// Pool stats for every account, for the health endpoint.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.runtimes
            .lock()
            .values()
            .map(|r| r.pool.stats())
            .collect()
    }

    /// Bring the engine up. Calling `start` twice is a no-op.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("ticker loop already started — ignoring duplicate start");
            return Ok(());
        }

        let plan = self.compute_plan().await?;
        self.apply_plan(plan).await?;

        // Reload loop: recompute the plan and diff it into the pools.
        let this = self.clone();
        self.monitor.spawn("subscription-reloader", {
            let reloader = self.reloader.clone();
            async move {
                reloader
                    .run(move || {
                        let this = this.clone();
                        async move { this.reconcile().await }
                    })
                    .await
            }
        });

        // Batch flusher.
        self.monitor.spawn("batch-flusher", {
            let batcher = self.batcher.clone();
            async move { batcher.run().await }
        });

        // Synthetic data pump and cache sweeper, only when mock mode is on.
        if let Some(cache) = &self.mock_cache {
            let processor = self.processor.clone();
            let resolved = self.resolved.clone();
            self.monitor.spawn("mock-pump", async move {
                let mut interval = tokio::time::interval(MOCK_PUMP_INTERVAL);
                loop {
                    interval.tick().await;
                    let instruments: Vec<Arc<Instrument>> =
                        resolved.read().values().cloned().collect();
                    processor.synthesize_idle(&instruments, Utc::now());
                }
            });

            let cache = cache.clone();
            self.monitor.spawn("mock-sweeper", {
                let clock_cache = cache;
                async move {
                    let mut interval = tokio::time::interval(MOCK_SWEEP_INTERVAL);
                    loop {
                        interval.tick().await;
                        let today = Utc::now().date_naive();
                        clock_cache.sweep(today);
                    }
                }
            });
        }

        info!("multi-account ticker loop started");
        Ok(())
    }

    /// Recompute the plan and apply it as a diff. Called by the reloader.
    pub async fn reconcile(&self) -> Result<()> {
        let plan = self.compute_plan().await?;
        self.apply_plan(plan).await
    }

    /// Tear everything down: stream tasks, reloader, batcher drain, pools.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let runtimes = self.runtimes.lock();
            for account in runtimes.keys() {
                self.monitor.cancel(&format!("stream:{account}"));
            }
        }
        self.monitor.cancel("subscription-reloader");
        self.monitor.cancel("mock-pump");
        self.monitor.cancel("mock-sweeper");
        self.monitor.cancel("batch-flusher");

        self.batcher.stop().await;

        let mut runtimes = self.runtimes.lock();
        for (account, runtime) in runtimes.drain() {
            runtime.pool.shutdown();
            debug!(account = %account, "account runtime torn down");
        }

        info!("multi-account ticker loop stopped");
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    async fn compute_plan(&self) -> Result<Plan> {
        let now = Utc::now();
        let subscriptions = self
            .store
            .list_active()
            .context("failed to load active subscriptions")?;

        let tokens: Vec<u32> = subscriptions.iter().map(|s| s.instrument_token).collect();
        let modes: HashMap<u32, TickMode> = subscriptions
            .iter()
            .map(|s| (s.instrument_token, s.requested_mode))
            .collect();
        let prev_accounts: HashMap<u32, Option<String>> = subscriptions
            .iter()
            .map(|s| (s.instrument_token, s.assigned_account_id.clone()))
            .collect();

        let (mut resolved, mut pruned) = self
            .registry
            .resolve_many(&tokens, now)
            .await
            .context("failed to resolve subscriptions against the registry")?;

        // Expired derivatives are as dead as deregistered ones.
        let today = self.registry_market_date();
        let expired: Vec<u32> = resolved
            .iter()
            .filter(|(_, i)| i.is_expired(today))
            .map(|(t, _)| *t)
            .collect();
        for token in &expired {
            resolved.remove(token);
        }
        pruned.extend(expired);

        if !pruned.is_empty() {
            self.store
                .deactivate_many(&pruned)
                .context("failed to deactivate pruned subscriptions")?;
        }

        let live: Vec<Arc<Instrument>> = resolved.values().cloned().collect();
        let accounts = self.sessions.healthy_accounts();
        let assignments = round_robin(&live, &accounts);

        info!(
            active = tokens.len(),
            resolved = resolved.len(),
            pruned = pruned.len(),
            accounts = accounts.len(),
            "subscription plan computed"
        );

        Ok(Plan {
            assignments,
            resolved,
            modes,
            prev_accounts,
            pruned,
        })
    }

    fn registry_market_date(&self) -> chrono::NaiveDate {
        // IST day boundary, consistent with the expiry clock.
        Utc::now()
            .with_timezone(&crate::greeks::expiry::ist_offset())
            .date_naive()
    }

    async fn apply_plan(&self, plan: Plan) -> Result<()> {
        *self.resolved.write() = plan.resolved.clone();

        for token in &plan.pruned {
            self.publish_event(SubscriptionEventType::SubscriptionRemoved, *token, json!({}))
                .await;
        }

        // Ensure a runtime per assigned account, and diff existing pools.
        for (account_id, instruments) in &plan.assignments {
            let tokens: HashSet<u32> =
                instruments.iter().map(|i| i.instrument_token).collect();

            let existing_pool = self
                .runtimes
                .lock()
                .get(account_id)
                .map(|r| r.pool.clone());

            match existing_pool {
                None => {
                    self.spawn_account_stream(account_id, instruments.clone(), &plan.modes);
                }
                Some(pool) => {
                    let current = pool.desired_tokens();
                    let (to_add, to_remove) = diff_tokens(&current, &tokens);
                    if to_add.is_empty() && to_remove.is_empty() {
                        continue;
                    }

                    // Wire changes for an account run under its lease.
                    match self.sessions.lease(account_id).await {
                        Ok(_lease) => {
                            for (mode, batch) in group_by_mode(&to_add, &plan.modes) {
                                pool.subscribe(&batch, mode)
                                    .context("pool subscribe failed")?;
                            }
                            if !to_remove.is_empty() {
                                pool.unsubscribe(&to_remove)
                                    .context("pool unsubscribe failed")?;
                            }
                            info!(
                                account = %account_id,
                                added = to_add.len(),
                                removed = to_remove.len(),
                                "assignment diff applied — streams untouched"
                            );
                        }
                        Err(e) => {
                            warn!(account = %account_id, error = %e, "lease unavailable — diff deferred to next reload");
                        }
                    }
                    pool.close_idle();
                }
            }
        }

        // Accounts that lost their assignment entirely (gone unhealthy or
        // removed from config) are torn down.
        let assigned: HashSet<&String> = plan.assignments.keys().collect();
        let orphaned: Vec<String> = self
            .runtimes
            .lock()
            .keys()
            .filter(|a| !assigned.contains(a))
            .cloned()
            .collect();
        for account in orphaned {
            if let Some(runtime) = self.runtimes.lock().remove(&account) {
                runtime.pool.shutdown();
            }
            self.monitor.cancel(&format!("stream:{account}"));
            warn!(account = %account, "account dropped from assignment — stream torn down");
        }

        // Persist assignment and announce moves.
        for (account_id, instruments) in &plan.assignments {
            for instrument in instruments {
                let token = instrument.instrument_token;
                let prev = plan.prev_accounts.get(&token).cloned().flatten();
                if prev.as_deref() != Some(account_id) {
                    self.store
                        .set_assignment(token, Some(account_id))
                        .context("failed to persist assignment")?;
                    if let Some(prev_account) = prev {
                        self.publish_event(
                            SubscriptionEventType::SubscriptionReassigned,
                            token,
                            json!({"from": prev_account, "to": account_id}),
                        )
                        .await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Create the pool and the streaming task for a newly assigned account.
    fn spawn_account_stream(
        &self,
        account_id: &str,
        instruments: Vec<Arc<Instrument>>,
        modes: &HashMap<u32, TickMode>,
    ) {
        let account_config = self
            .config
            .accounts
            .iter()
            .find(|a| a.account_id == account_id)
            .cloned()
            .unwrap_or_else(|| AccountConfig {
                account_id: account_id.to_string(),
                api_key: String::new(),
                access_token: String::new(),
                enabled: true,
            });

        let (tick_tx, mut tick_rx) = mpsc::channel::<Vec<TickFrame>>(TICK_CHANNEL_DEPTH);
        let pool = (self.pool_factory)(&account_config, tick_tx);

        self.runtimes.lock().insert(
            account_id.to_string(),
            AccountRuntime { pool: pool.clone() },
        );

        let account = account_id.to_string();
        let sessions = self.sessions.clone();
        let bootstrapper = self.bootstrapper.clone();
        let processor = self.processor.clone();
        let resolved = self.resolved.clone();
        let modes = modes.clone();

        self.monitor.spawn(format!("stream:{account}"), async move {
            // Backfill first; best-effort by contract.
            if let Err(e) = bootstrapper.bootstrap(&account, &instruments).await {
                warn!(account = %account, error = %e, "historical bootstrap failed — continuing");
            }

            // Open the pool subscription under the account lease.
            {
                let _lease = sessions
                    .lease(&account)
                    .await
                    .map_err(|e| anyhow::anyhow!("initial subscribe lease: {e}"))?;
                let tokens: Vec<u32> =
                    instruments.iter().map(|i| i.instrument_token).collect();
                for (mode, batch) in group_by_mode(&tokens, &modes) {
                    pool.subscribe(&batch, mode)?;
                }
                info!(account = %account, tokens = tokens.len(), "account stream subscribed");
            }

            // Receive loop: arrival order within the account is preserved.
            while let Some(batch) = tick_rx.recv().await {
                let lookup = resolved.read();
                processor.process_batch(&account, &lookup, &batch, Utc::now());
            }

            Ok(())
        });
    }

    async fn publish_event(
        &self,
        event_type: SubscriptionEventType,
        token: u32,
        metadata: serde_json::Value,
    ) {
        let event = SubscriptionEvent::now(event_type, token, metadata);
        match serde_json::to_string(&event) {
            Ok(json) => self.sink.publish(&self.channels.events, json).await,
            Err(e) => debug!(error = %e, "event serialization failed"),
        }
    }

    /// Publish a lifecycle event for an externally triggered change (the
    /// REST edge calls this after a store write).
    pub async fn announce(
        &self,
        event_type: SubscriptionEventType,
        token: u32,
        metadata: serde_json::Value,
    ) {
        self.publish_event(event_type, token, metadata).await;
    }
}

fn group_by_mode(tokens: &[u32], modes: &HashMap<u32, TickMode>) -> Vec<(TickMode, Vec<u32>)> {
    let mut grouped: HashMap<TickMode, Vec<u32>> = HashMap::new();
    for &token in tokens {
        let mode = modes.get(&token).copied().unwrap_or(TickMode::Quote);
        grouped.entry(mode).or_default().push(token);
    }
    grouped.into_iter().collect()
}

impl std::fmt::Debug for MultiAccountTickerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiAccountTickerLoop")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("accounts", &self.runtimes.lock().len())
            .finish()
    }
}
