// =============================================================================
// Broker WebSocket connection — socket lifecycle for one pool shard
// =============================================================================
//
// Each physical connection owns its reconnect loop: exponential backoff
// (1 s base, 30 s cap, jitter), and on every successful connect the full
// desired-token set of the shard is re-subscribed before tick delivery
// resumes. Parsed ticks are handed to the processing side through a
// bounded channel; shared pool state is only ever touched under the pool
// mutex, never from within socket I/O.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::broker::pool::PoolShared;
use crate::broker::wire;
use crate::ticks::frames::TickFrame;
use crate::types::TickMode;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Commands pushed from the pool to a connection task.
#[derive(Debug)]
pub enum WireCommand {
    Subscribe { tokens: Vec<u32>, mode: TickMode },
    Unsubscribe { tokens: Vec<u32> },
    Close,
}

/// Reconnecting socket loop for connection `conn_id` of one account's pool.
///
/// Returns when a `Close` command arrives or the command channel drops.
pub async fn run_connection(
    url: String,
    account_id: String,
    conn_id: usize,
    shared: Arc<Mutex<PoolShared>>,
    mut cmd_rx: mpsc::UnboundedReceiver<WireCommand>,
    tick_tx: mpsc::Sender<Vec<TickFrame>>,
) -> Result<()> {
    let mut backoff = BACKOFF_BASE;

    loop {
        let ws = match connect_async(&url).await {
            Ok((ws, _response)) => {
                info!(account = %account_id, conn = conn_id, "broker websocket connected");
                backoff = BACKOFF_BASE;
                ws
            }
            Err(e) => {
                warn!(
                    account = %account_id,
                    conn = conn_id,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "broker websocket connect failed"
                );
                if wait_backoff(&mut backoff, &mut cmd_rx).await {
                    return Ok(());
                }
                continue;
            }
        };

        let (mut write, mut read) = ws.split();

        // Snapshot the desired set under the mutex, then re-subscribe on the
        // wire with the mutex released.
        let by_mode = {
            let mut s = shared.lock();
            let slot = &mut s.connections[conn_id];
            slot.connected = true;
            slot.desired_by_mode()
        };

        let mut resubscribe_failed = false;
        for (mode, tokens) in &by_mode {
            if tokens.is_empty() {
                continue;
            }
            if write
                .send(Message::Text(wire::subscribe_message(tokens)))
                .await
                .is_err()
                || write
                    .send(Message::Text(wire::mode_message(*mode, tokens)))
                    .await
                    .is_err()
            {
                resubscribe_failed = true;
                break;
            }
        }

        if resubscribe_failed {
            mark_disconnected(&shared, conn_id, &account_id);
            if wait_backoff(&mut backoff, &mut cmd_rx).await {
                return Ok(());
            }
            continue;
        }

        // Re-subscription is on the wire: the shard is live again.
        {
            let mut s = shared.lock();
            let slot = &mut s.connections[conn_id];
            slot.subscribed = slot.desired.clone();
            debug!(
                account = %account_id,
                conn = conn_id,
                tokens = slot.subscribed.len(),
                "desired set re-applied after (re)connect"
            );
        }

        // Main session loop: pool commands and socket frames.
        let session_closed = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(WireCommand::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        break true;
                    }
                    Some(WireCommand::Subscribe { tokens, mode }) => {
                        let sub_ok = write
                            .send(Message::Text(wire::subscribe_message(&tokens)))
                            .await
                            .is_ok()
                            && write
                                .send(Message::Text(wire::mode_message(mode, &tokens)))
                                .await
                                .is_ok();
                        if sub_ok {
                            let mut s = shared.lock();
                            s.connections[conn_id].subscribed.extend(tokens);
                        } else {
                            break false;
                        }
                    }
                    Some(WireCommand::Unsubscribe { tokens }) => {
                        let unsub_ok = write
                            .send(Message::Text(wire::unsubscribe_message(&tokens)))
                            .await
                            .is_ok();
                        {
                            let mut s = shared.lock();
                            for t in &tokens {
                                s.connections[conn_id].subscribed.remove(t);
                            }
                        }
                        if !unsub_ok {
                            break false;
                        }
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Binary(buf))) => {
                        let ticks = wire::parse_binary(&buf, Utc::now());
                        if !ticks.is_empty() {
                            // Backpressure lands here, not in shared state.
                            if tick_tx.send(ticks).await.is_err() {
                                // Processing side is gone; shut the shard down.
                                break true;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Text(_text))) => {
                        // Broker postbacks and order updates arrive as text;
                        // this shard only carries market data.
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(account = %account_id, conn = conn_id, error = %e, "socket read error");
                        break false;
                    }
                    None => {
                        warn!(account = %account_id, conn = conn_id, "socket closed by broker");
                        break false;
                    }
                },
            }
        };

        mark_disconnected(&shared, conn_id, &account_id);
        if session_closed {
            return Ok(());
        }
        if wait_backoff(&mut backoff, &mut cmd_rx).await {
            return Ok(());
        }
    }
}

fn mark_disconnected(shared: &Arc<Mutex<PoolShared>>, conn_id: usize, account_id: &str) {
    let mut s = shared.lock();
    let slot = &mut s.connections[conn_id];
    slot.connected = false;
    slot.subscribed.clear();
    debug!(account = %account_id, conn = conn_id, "connection marked disconnected");
}

/// Sleep the backoff interval (with jitter), doubling it for next time.
/// Subscribe/unsubscribe commands arriving while disconnected are dropped:
/// the reconnect path re-applies the full desired set anyway. Returns true
/// when a `Close` arrived and the loop should exit.
async fn wait_backoff(
    backoff: &mut Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<WireCommand>,
) -> bool {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    let wait = *backoff + jitter;
    *backoff = (*backoff * 2).min(BACKOFF_CAP);

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WireCommand::Close) => return true,
                Some(_) => continue,
            },
        }
    }
}
