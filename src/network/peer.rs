//! Per-connection state machine, traffic counters, and the I/O loops every
//! tunnel connection runs regardless of side: the outbound writer draining
//! the peer's frame queue, and the keepalive/latency task.

use crate::codec::frame::TunnelMsg;
use crate::codec::parser::Parser;
use crate::crypto::SharedBlock;
use crate::network::queue::FrameQueue;
use crate::network::tcp_transport::FrameWriter;
use crate::network::{DRAIN_TIMEOUT, IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::util::now_unix;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one tunnel connection.
///
/// `AwaitingHandshake → Active → Draining → Closed`; any state may jump to
/// `Closed` on I/O error or frame decode failure. `Draining` forwards no new
/// frames and waits briefly for in-flight I/O to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    AwaitingHandshake,
    Active,
    Draining,
    Closed,
}

/// Shared, lock-guarded state cell. Transitions are monotonic: a `Closed`
/// connection never revives.
pub struct PeerStateCell {
    state: Mutex<PeerState>,
}

impl PeerStateCell {
    pub fn new(state: PeerState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn get(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a transition; returns the previous state. Attempts to leave
    /// `Closed` are ignored.
    pub fn set(&self, next: PeerState) -> PeerState {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let prev = *guard;
        if prev != PeerState::Closed {
            *guard = next;
        }
        prev
    }
}

/// Byte and packet counters for one direction pair, shared between the
/// reader/writer tasks and the stats surface.
#[derive(Default)]
pub struct PeerCounters {
    pub bytes_tx: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub packets_tx: AtomicU64,
    pub packets_rx: AtomicU64,
}

impl PeerCounters {
    pub fn record_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSnapshot {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub packets_tx: u64,
    pub packets_rx: u64,
}

/// Latency probes awaiting their echo, keyed by token.
pub type PendingProbes = Arc<Mutex<HashMap<[u8; 8], Instant>>>;

pub fn pending_probes() -> PendingProbes {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Outbound writer: drains the frame queue onto the socket, preserving
/// per-peer order. On cancellation (or queue close) it flushes whatever is
/// still queued within the drain budget, then shuts the write half down.
pub async fn writer_loop(
    mut writer: FrameWriter,
    queue: Arc<FrameQueue>,
    block: SharedBlock,
    counters: Arc<PeerCounters>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            msg = queue.pop() => {
                let Some(msg) = msg else { break };
                if !write_msg(&mut writer, msg, &block, &counters).await {
                    token.cancel();
                    return;
                }
            }
            _ = token.cancelled() => break,
        }
    }

    queue.close();
    let drain = async {
        while let Some(msg) = queue.pop().await {
            if !write_msg(&mut writer, msg, &block, &counters).await {
                break;
            }
        }
    };
    let _ = timeout(DRAIN_TIMEOUT, drain).await;
    writer.close().await;
}

async fn write_msg(
    writer: &mut FrameWriter,
    msg: TunnelMsg,
    block: &SharedBlock,
    counters: &Arc<PeerCounters>,
) -> bool {
    let buf = match Parser::marshal(msg, block.as_ref().as_ref()) {
        Ok(buf) => buf,
        Err(e) => {
            tracing::warn!("marshal failed: {}", e);
            return true;
        }
    };
    match writer.write_raw(&buf).await {
        Ok(()) => {
            counters.record_tx(buf.len());
            true
        }
        Err(e) => {
            tracing::debug!("write failed: {}", e);
            false
        }
    }
}

/// Emits KEEPALIVE and a latency probe every interval, and cancels the
/// connection when nothing has arrived for the idle timeout.
pub async fn keepalive_loop(
    queue: Arc<FrameQueue>,
    last_activity: Arc<AtomicU64>,
    pending: PendingProbes,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = now_unix().saturating_sub(last_activity.load(Ordering::Relaxed));
                if idle >= IDLE_TIMEOUT.as_secs() {
                    tracing::warn!("peer idle for {}s, closing", idle);
                    token.cancel();
                    return;
                }

                queue.push(TunnelMsg::KeepAlive);
                let probe_token: [u8; 8] = rand::random();
                {
                    let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                    // Unanswered probes just age out with the map reset.
                    if map.len() > 16 {
                        map.clear();
                    }
                    map.insert(probe_token, Instant::now());
                }
                queue.push(TunnelMsg::LatencyProbe(probe_token));
            }
            _ = token.cancelled() => return,
        }
    }
}

/// Resolve an echoed probe token to a round-trip time in milliseconds.
pub fn resolve_probe(pending: &PendingProbes, token: &[u8; 8]) -> Option<f64> {
    pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(token)
        .map(|started| started.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        let cell = PeerStateCell::new(PeerState::Active);
        cell.set(PeerState::Draining);
        assert_eq!(cell.get(), PeerState::Draining);
        cell.set(PeerState::Closed);
        cell.set(PeerState::Active);
        assert_eq!(cell.get(), PeerState::Closed);
    }
}
