// =============================================================================
// Broker Connection Pool — transparent sharding across physical sockets
// =============================================================================
//
// One pool per account. A logical subscription set is spread across
// physical WebSocket connections, each capped at the broker's per-socket
// instrument limit. Placement fills existing connections first and creates
// a new one only when every existing connection is at capacity.
//
// Concurrency discipline: the connection list and the token → connection
// index mutate only under the pool-wide mutex, and the mutex is NEVER held
// across wire I/O. `subscribe` records tokens in the desired set
// synchronously (linearizable), then pushes to the wire; a failed push
// rolls the index back under the mutex again.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::ws::{self, WireCommand};
use crate::supervision::TaskMonitor;
use crate::ticks::frames::TickFrame;
use crate::types::TickMode;

/// Grace period before an emptied connection is closed.
const IDLE_CLOSE_GRACE: Duration = Duration::from_secs(60);

/// One physical connection's bookkeeping. Lives inside the pool mutex.
pub struct ConnectionSlot {
    pub id: usize,
    /// Target set; re-applied after every reconnect.
    pub desired: HashSet<u32>,
    pub modes: HashMap<u32, TickMode>,
    /// Tokens currently on the wire.
    pub subscribed: HashSet<u32>,
    pub connected: bool,
    pub closed: bool,
    pub emptied_at: Option<Instant>,
    pub cmd_tx: mpsc::UnboundedSender<WireCommand>,
}

impl ConnectionSlot {
    /// Group the desired set by requested mode for (re)subscription.
    pub fn desired_by_mode(&self) -> Vec<(TickMode, Vec<u32>)> {
        let mut by_mode: HashMap<TickMode, Vec<u32>> = HashMap::new();
        for token in &self.desired {
            let mode = self.modes.get(token).copied().unwrap_or(TickMode::Quote);
            by_mode.entry(mode).or_default().push(*token);
        }
        by_mode.into_iter().collect()
    }
}

/// Shared pool state; every mutation happens under this mutex.
#[derive(Default)]
pub struct PoolShared {
    pub connections: Vec<ConnectionSlot>,
    pub token_index: HashMap<u32, usize>,
}

/// Per-connection view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connection_id: usize,
    pub desired: usize,
    pub subscribed: usize,
    pub capacity: usize,
    pub fill_pct: f64,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub account_id: String,
    pub connections: Vec<ConnectionStats>,
    pub total_capacity: usize,
    pub total_subscribed: usize,
}

pub struct BrokerConnectionPool {
    account_id: String,
    ws_url: String,
    capacity_per_connection: usize,
    shared: Arc<Mutex<PoolShared>>,
    tick_tx: mpsc::Sender<Vec<TickFrame>>,
    monitor: Arc<TaskMonitor>,
    /// Test pools skip socket tasks; placement logic is identical.
    spawn_sockets: bool,
}

impl BrokerConnectionPool {
    pub fn new(
        account_id: impl Into<String>,
        api_key: &str,
        access_token: &str,
        capacity_per_connection: usize,
        tick_tx: mpsc::Sender<Vec<TickFrame>>,
        monitor: Arc<TaskMonitor>,
    ) -> Self {
        let ws_url = format!(
            "wss://ws.kite.trade?api_key={api_key}&access_token={access_token}"
        );
        Self {
            account_id: account_id.into(),
            ws_url,
            capacity_per_connection: capacity_per_connection.max(1),
            shared: Arc::new(Mutex::new(PoolShared::default())),
            tick_tx,
            monitor,
            spawn_sockets: true,
        }
    }

    /// Pool whose connections never dial out. Used by tests to exercise
    /// placement and index behavior deterministically.
    #[cfg(test)]
    pub fn new_offline(
        account_id: impl Into<String>,
        capacity_per_connection: usize,
        tick_tx: mpsc::Sender<Vec<TickFrame>>,
        monitor: Arc<TaskMonitor>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            ws_url: String::new(),
            capacity_per_connection: capacity_per_connection.max(1),
            shared: Arc::new(Mutex::new(PoolShared::default())),
            tick_tx,
            monitor,
            spawn_sockets: false,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Subscribe tokens at `mode`, sharding across connections.
    ///
    /// Tokens already present keep their placement (a changed mode is
    /// re-pushed in place). New tokens go to the first connection with free
    /// capacity; a new connection is created only when all are full.
    pub fn subscribe(&self, tokens: &[u32], mode: TickMode) -> Result<()> {
        let mut new_pushes: HashMap<usize, Vec<u32>> = HashMap::new();
        let mut mode_pushes: HashMap<usize, Vec<u32>> = HashMap::new();
        let mut spawned: Vec<(usize, mpsc::UnboundedReceiver<WireCommand>)> = Vec::new();

        {
            let mut s = self.shared.lock();
            for &token in tokens {
                if let Some(&idx) = s.token_index.get(&token) {
                    // Placement unchanged; re-push only on a mode change.
                    let slot = &mut s.connections[idx];
                    if slot.modes.get(&token) != Some(&mode) {
                        slot.modes.insert(token, mode);
                        mode_pushes.entry(idx).or_default().push(token);
                    }
                    continue;
                }

                let idx = match self.place_locked(&mut s) {
                    Some(idx) => idx,
                    None => {
                        let (idx, rx) = Self::create_slot_locked(&mut s);
                        spawned.push((idx, rx));
                        idx
                    }
                };

                let slot = &mut s.connections[idx];
                slot.desired.insert(token);
                slot.modes.insert(token, mode);
                slot.emptied_at = None;
                s.token_index.insert(token, idx);
                new_pushes.entry(idx).or_default().push(token);
            }
        }

        // Connection creation is asynchronous: socket tasks start after the
        // index is already consistent.
        for (idx, rx) in spawned {
            self.spawn_socket(idx, rx);
        }

        // Wire pushes happen with the mutex released.
        let mut failed: Vec<(usize, Vec<u32>)> = Vec::new();
        {
            let s = self.shared.lock();
            for (idx, batch) in &new_pushes {
                let send = s.connections[*idx].cmd_tx.send(WireCommand::Subscribe {
                    tokens: batch.clone(),
                    mode,
                });
                if send.is_err() {
                    failed.push((*idx, batch.clone()));
                }
            }
            for (idx, batch) in &mode_pushes {
                // A dead shard's reconnect path re-applies modes anyway.
                let _ = s.connections[*idx].cmd_tx.send(WireCommand::Subscribe {
                    tokens: batch.clone(),
                    mode,
                });
            }
        }

        if !failed.is_empty() {
            // Roll the index back under the mutex for tokens whose shard is
            // dead; the next reload will re-place them.
            let mut s = self.shared.lock();
            for (idx, batch) in &failed {
                for token in batch {
                    s.connections[*idx].desired.remove(token);
                    s.connections[*idx].modes.remove(token);
                    s.token_index.remove(token);
                }
            }
            warn!(
                account = %self.account_id,
                tokens = failed.iter().map(|(_, b)| b.len()).sum::<usize>(),
                "subscribe rolled back for dead connections"
            );
        }

        Ok(())
    }

    /// Remove tokens from the desired set and the wire.
    pub fn unsubscribe(&self, tokens: &[u32]) -> Result<()> {
        let mut pushes: HashMap<usize, Vec<u32>> = HashMap::new();

        {
            let mut s = self.shared.lock();
            for &token in tokens {
                if let Some(idx) = s.token_index.remove(&token) {
                    let slot = &mut s.connections[idx];
                    slot.desired.remove(&token);
                    slot.modes.remove(&token);
                    if slot.desired.is_empty() {
                        slot.emptied_at = Some(Instant::now());
                    }
                    pushes.entry(idx).or_default().push(token);
                }
            }
        }

        let s = self.shared.lock();
        for (idx, batch) in pushes {
            let _ = s.connections[idx]
                .cmd_tx
                .send(WireCommand::Unsubscribe { tokens: batch });
        }
        Ok(())
    }

    /// Close connections that have been empty past the idle grace period.
    pub fn close_idle(&self) {
        self.close_idle_after(IDLE_CLOSE_GRACE)
    }

    fn close_idle_after(&self, grace: Duration) {
        let mut to_close = Vec::new();
        {
            let mut s = self.shared.lock();
            for slot in s.connections.iter_mut() {
                if !slot.closed
                    && slot.desired.is_empty()
                    && matches!(slot.emptied_at, Some(at) if at.elapsed() >= grace)
                {
                    slot.closed = true;
                    slot.connected = false;
                    to_close.push((slot.id, slot.cmd_tx.clone()));
                }
            }
        }
        for (id, tx) in to_close {
            let _ = tx.send(WireCommand::Close);
            info!(account = %self.account_id, conn = id, "idle connection closed");
        }
    }

    /// Union of every connection's desired set.
    pub fn desired_tokens(&self) -> HashSet<u32> {
        self.shared.lock().token_index.keys().copied().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let s = self.shared.lock();
        let connections: Vec<ConnectionStats> = s
            .connections
            .iter()
            .filter(|c| !c.closed)
            .map(|c| ConnectionStats {
                connection_id: c.id,
                desired: c.desired.len(),
                subscribed: c.subscribed.len(),
                capacity: self.capacity_per_connection,
                fill_pct: (c.desired.len() as f64 / self.capacity_per_connection as f64) * 100.0,
                connected: c.connected,
            })
            .collect();

        PoolStats {
            account_id: self.account_id.clone(),
            total_capacity: connections.len() * self.capacity_per_connection,
            total_subscribed: s.token_index.len(),
            connections,
        }
    }

    /// Close every connection. Used during shutdown.
    pub fn shutdown(&self) {
        let senders: Vec<_> = {
            let mut s = self.shared.lock();
            s.connections
                .iter_mut()
                .filter(|c| !c.closed)
                .map(|c| {
                    c.closed = true;
                    c.connected = false;
                    c.cmd_tx.clone()
                })
                .collect()
        };
        for tx in senders {
            let _ = tx.send(WireCommand::Close);
        }
        info!(account = %self.account_id, "connection pool shut down");
    }

    /// First open connection with free capacity, in creation order.
    fn place_locked(&self, s: &mut PoolShared) -> Option<usize> {
        s.connections
            .iter()
            .position(|c| !c.closed && c.desired.len() < self.capacity_per_connection)
    }

    fn create_slot_locked(s: &mut PoolShared) -> (usize, mpsc::UnboundedReceiver<WireCommand>) {
        let id = s.connections.len();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        s.connections.push(ConnectionSlot {
            id,
            desired: HashSet::new(),
            modes: HashMap::new(),
            subscribed: HashSet::new(),
            connected: false,
            closed: false,
            emptied_at: None,
            cmd_tx,
        });
        debug!(conn = id, "connection slot created");
        (id, cmd_rx)
    }

    fn spawn_socket(&self, conn_id: usize, mut cmd_rx: mpsc::UnboundedReceiver<WireCommand>) {
        let name = format!("broker-ws:{}:{}", self.account_id, conn_id);

        if !self.spawn_sockets {
            // Offline pool: keep the command channel open so pushes succeed,
            // but never dial out.
            self.monitor.spawn(name, async move {
                while cmd_rx.recv().await.is_some() {}
                Ok(())
            });
            return;
        }

        let url = self.ws_url.clone();
        let account = self.account_id.clone();
        let shared = self.shared.clone();
        let tick_tx = self.tick_tx.clone();
        self.monitor.spawn(
            name,
            ws::run_connection(url, account, conn_id, shared, cmd_rx, tick_tx),
        );
    }
}

impl std::fmt::Debug for BrokerConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BrokerConnectionPool")
            .field("account_id", &self.account_id)
            .field("connections", &stats.connections.len())
            .field("total_subscribed", &stats.total_subscribed)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cap: usize) -> BrokerConnectionPool {
        let (tick_tx, _tick_rx) = mpsc::channel(16);
        // Hold the receiver alive via leak: tests never read ticks.
        std::mem::forget(_tick_rx);
        BrokerConnectionPool::new_offline("primary", cap, tick_tx, TaskMonitor::new())
    }

    #[tokio::test]
    async fn fan_out_2500_tokens_across_three_connections() {
        let p = pool(1000);
        let tokens: Vec<u32> = (1..=2500).collect();
        p.subscribe(&tokens, TickMode::Full).unwrap();

        let stats = p.stats();
        assert_eq!(stats.connections.len(), 3);
        assert_eq!(stats.connections[0].desired, 1000);
        assert_eq!(stats.connections[1].desired, 1000);
        assert_eq!(stats.connections[2].desired, 500);
        assert_eq!(stats.total_capacity, 3000);
        assert_eq!(stats.total_subscribed, 2500);
    }

    #[tokio::test]
    async fn no_connection_exceeds_capacity() {
        let p = pool(100);
        let tokens: Vec<u32> = (1..=950).collect();
        p.subscribe(&tokens, TickMode::Quote).unwrap();

        for conn in p.stats().connections {
            assert!(conn.desired <= 100);
        }
    }

    #[tokio::test]
    async fn resubscribing_is_idempotent() {
        let p = pool(1000);
        let tokens: Vec<u32> = (1..=10).collect();
        p.subscribe(&tokens, TickMode::Quote).unwrap();
        p.subscribe(&tokens, TickMode::Quote).unwrap();

        let stats = p.stats();
        assert_eq!(stats.connections.len(), 1);
        assert_eq!(stats.total_subscribed, 10);
    }

    #[tokio::test]
    async fn unsubscribe_restores_the_prior_desired_set() {
        let p = pool(1000);
        let base: Vec<u32> = (1..=100).collect();
        p.subscribe(&base, TickMode::Quote).unwrap();
        let before = p.desired_tokens();

        let extra: Vec<u32> = (101..=150).collect();
        p.subscribe(&extra, TickMode::Quote).unwrap();
        p.unsubscribe(&extra).unwrap();

        assert_eq!(p.desired_tokens(), before);
        assert_eq!(p.stats().total_subscribed, 100);
    }

    #[tokio::test]
    async fn each_token_lives_on_exactly_one_connection() {
        let p = pool(50);
        let tokens: Vec<u32> = (1..=170).collect();
        p.subscribe(&tokens, TickMode::Ltp).unwrap();

        let s = p.shared.lock();
        let mut seen = HashSet::new();
        for conn in &s.connections {
            for token in &conn.desired {
                assert!(seen.insert(*token), "token {token} on two connections");
            }
        }
        assert_eq!(seen.len(), 170);
    }

    #[tokio::test]
    async fn freed_capacity_is_reused_before_new_connections() {
        let p = pool(10);
        let first: Vec<u32> = (1..=10).collect();
        p.subscribe(&first, TickMode::Quote).unwrap();
        p.unsubscribe(&[1, 2, 3]).unwrap();

        p.subscribe(&[11, 12], TickMode::Quote).unwrap();
        assert_eq!(p.stats().connections.len(), 1);
    }

    #[tokio::test]
    async fn emptied_connection_closes_after_grace() {
        let p = pool(10);
        p.subscribe(&[1, 2], TickMode::Quote).unwrap();
        p.unsubscribe(&[1, 2]).unwrap();

        // Grace not yet elapsed: still counted.
        p.close_idle_after(Duration::from_secs(60));
        assert_eq!(p.stats().connections.len(), 1);

        p.close_idle_after(Duration::ZERO);
        assert_eq!(p.stats().connections.len(), 0);
    }

    #[tokio::test]
    async fn mode_change_keeps_placement() {
        let p = pool(10);
        p.subscribe(&[1], TickMode::Ltp).unwrap();
        p.subscribe(&[1], TickMode::Full).unwrap();

        let s = p.shared.lock();
        assert_eq!(s.connections.len(), 1);
        assert_eq!(s.connections[0].modes.get(&1), Some(&TickMode::Full));
    }
}
