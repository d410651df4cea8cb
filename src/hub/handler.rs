//! Per-connection session handler on the hub side.
//!
//! One session owns the acceptor half of the handshake, then splits into an
//! inbound reader (this task), an outbound writer draining the peer's frame
//! queue, and a keepalive/latency task. Frame order is preserved per peer in
//! both directions.

use crate::codec::errors::FrameError;
use crate::codec::frame::{DataMsg, HandshakeRequest, TunnelMsg, POOL_EXHAUSTED_ADDR};
use crate::codec::parser::Parser;
use crate::crypto::{plain_block, SharedBlock};
use crate::hub::forwarding::{ForwardingTable, PeerHandle};
use crate::hub::server::{broadcast_topology, InviteRoster};
use crate::intent::IntentStore;
use crate::network::peer::{
    keepalive_loop, pending_probes, resolve_probe, writer_loop, PeerCounters, PeerState,
    PeerStateCell, PendingProbes,
};
use crate::network::queue::FrameQueue;
use crate::network::tcp_transport::TcpTransport;
use crate::network::{Connection, HANDSHAKE_TIMEOUT, OUTBOUND_QUEUE_CAP, PROTOCOL_ERROR_LIMIT};
use crate::observe::{event, Sink};
use crate::topology::{NodeInfo, SharedTopology};
use crate::util::now_unix;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Everything a session needs from the daemon, shared by reference.
pub struct SessionCtx {
    pub table: Arc<ForwardingTable>,
    pub intent: Arc<IntentStore>,
    pub topology: SharedTopology,
    pub sink: Arc<dyn Sink>,
    pub aes: SharedBlock,
    pub to_device: mpsc::Sender<Vec<u8>>,
    pub invites: Arc<InviteRoster>,
    pub hub_vpn: Ipv4Addr,
    pub subnet: Ipv4Net,
    /// Cancelled on unrecoverable daemon errors (intent-store write failure,
    /// TUN loss); the daemon then drains everything and exits with code 2.
    pub fatal: CancellationToken,
    pub shutdown: CancellationToken,
}

pub async fn run_session(ctx: Arc<SessionCtx>, mut transport: TcpTransport) -> crate::Result<()> {
    let remote_addr = transport
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    // --- handshake, 5s budget ---
    let (enc_flag, req) = match timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut transport)).await {
        Ok(Ok(hs)) => hs,
        Ok(Err(e)) => {
            transport.close().await;
            return Err(e);
        }
        Err(_) => {
            transport.close().await;
            return Err("handshake timed out".into());
        }
    };

    let block = if enc_flag == 1 {
        ctx.aes.clone()
    } else {
        tracing::warn!("{} ({}) negotiated a PLAINTEXT tunnel", req.name, remote_addr);
        plain_block()
    };

    // --- address assignment ---
    let (vpn_ip, displaced) = match ctx.table.assign(&req.name) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!("address pool exhausted, rejecting {}", req.name);
            ctx.sink.log(event(
                "warn",
                "hub",
                format!("rejected {}: address pool exhausted", req.name),
            ));
            let _ = timeout(
                HANDSHAKE_TIMEOUT,
                transport.write_frame(POOL_EXHAUSTED_ADDR.as_bytes()),
            )
            .await;
            transport.close().await;
            return Ok(());
        }
    };
    if let Some(old) = displaced {
        tracing::info!(
            "{} reconnected, closed stale connection from {}",
            req.name,
            old.remote_addr
        );
    }

    // The assigned-IP frame must land within the handshake budget or the
    // address goes back to the pool.
    match timeout(
        HANDSHAKE_TIMEOUT,
        transport.write_frame(vpn_ip.to_string().as_bytes()),
    )
    .await
    {
        Ok(Ok(())) => {}
        _ => {
            ctx.table.release_addr(vpn_ip);
            transport.close().await;
            return Err(format!("assigned-ip frame to {} not delivered", req.name).into());
        }
    }

    // --- registration ---
    let queue = Arc::new(FrameQueue::new(OUTBOUND_QUEUE_CAP));
    let counters = Arc::new(PeerCounters::default());
    let state = Arc::new(PeerStateCell::new(PeerState::Active));
    let last_activity = Arc::new(AtomicU64::new(now_unix()));
    let conn_token = ctx.shutdown.child_token();
    let handle = PeerHandle {
        id: ctx.table.next_id(),
        name: req.name.clone(),
        vpn_ip,
        remote_addr: remote_addr.clone(),
        encrypted: enc_flag == 1,
        queue: queue.clone(),
        counters: counters.clone(),
        state: state.clone(),
        last_activity: last_activity.clone(),
        connected_at: now_unix(),
        cancel: conn_token.clone(),
    };

    if let Err(e) = ctx.intent.set_connected(vpn_ip, &req.name, req.route_all) {
        tracing::error!("intent store write failed for {}: {}", req.name, e);
        ctx.table.release_addr(vpn_ip);
        transport.close().await;
        ctx.fatal.cancel();
        return Err(e);
    }

    // Queue the invite before anything else can enqueue, so a re-appeared
    // routing client sees RECONNECT_INVITE as its first post-handshake frame.
    if ctx.invites.take(&req.name) {
        tracing::info!("inviting {} to re-enable routing", req.name);
        queue.push(TunnelMsg::ReconnectInvite(Some(
            serde_json::json!({"reason": "hub-restart"}),
        )));
    }

    ctx.table.register(handle.clone());
    {
        let mut graph = ctx.topology.lock().unwrap_or_else(|e| e.into_inner());
        graph.add_direct_peer(
            vpn_ip,
            NodeInfo {
                name: req.name.clone(),
                os: req.os.clone(),
                version: req.version.clone(),
                public_addr: req
                    .public_addr_hint
                    .clone()
                    .or_else(|| Some(remote_addr.clone())),
                distance: -1,
                latency_ms: None,
                last_seen: now_unix(),
                geo: None,
                is_direct: true,
            },
        );
    }
    broadcast_topology(&ctx.table, &ctx.topology);
    ctx.sink.log(event(
        "info",
        "hub",
        format!("{} connected from {} as {}", req.name, remote_addr, vpn_ip),
    ));
    tracing::info!("{} active at {} (encrypted: {})", req.name, vpn_ip, enc_flag == 1);

    // --- I/O tasks ---
    let (mut reader, writer) = transport.split();
    let probes = pending_probes();

    let writer_task = tokio::spawn(writer_loop(
        writer,
        queue.clone(),
        block.clone(),
        counters.clone(),
        conn_token.clone(),
    ));
    let keepalive_task = tokio::spawn(keepalive_loop(
        queue.clone(),
        last_activity.clone(),
        probes.clone(),
        conn_token.clone(),
    ));

    // --- inbound reader ---
    let mut consecutive_errors: u32 = 0;
    let session_result: crate::Result<()> = loop {
        tokio::select! {
            result = reader.read_frame() => {
                let payload = match result {
                    Ok(payload) => payload,
                    // Oversize frames are protocol errors; the reader already
                    // discarded the body, so the stream is still in sync.
                    Err(e) if e.downcast_ref::<FrameError>().is_some() => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            "protocol error from {} ({}/{}): {}",
                            req.name, consecutive_errors, PROTOCOL_ERROR_LIMIT, e
                        );
                        if consecutive_errors >= PROTOCOL_ERROR_LIMIT {
                            break Err("protocol error threshold exceeded".into());
                        }
                        continue;
                    }
                    Err(e) => break Err(e),
                };
                counters.record_rx(payload.len());
                last_activity.store(now_unix(), Ordering::Relaxed);

                match Parser::unmarshal(payload, block.as_ref().as_ref()) {
                    Ok(Some(msg)) => {
                        consecutive_errors = 0;
                        if !dispatch(&ctx, &handle, &probes, msg).await {
                            break Ok(());
                        }
                    }
                    Ok(None) => {
                        // Unknown discriminator: dropped for forward compat.
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            "protocol error from {} ({}/{}): {}",
                            req.name, consecutive_errors, PROTOCOL_ERROR_LIMIT, e
                        );
                        if consecutive_errors >= PROTOCOL_ERROR_LIMIT {
                            break Err("protocol error threshold exceeded".into());
                        }
                    }
                }
            }
            _ = conn_token.cancelled() => break Ok(()),
        }
        if state.get() == PeerState::Closed {
            break Ok(());
        }
    };

    // --- teardown ---
    state.set(PeerState::Draining);
    queue.close();
    conn_token.cancel();
    let _ = writer_task.await;
    keepalive_task.abort();
    state.set(PeerState::Closed);

    let removed = ctx.table.remove(vpn_ip, handle.id);
    if removed {
        let mut graph = ctx.topology.lock().unwrap_or_else(|e| e.into_inner());
        graph.remove_peer(vpn_ip);
        drop(graph);
        broadcast_topology(&ctx.table, &ctx.topology);
    }
    ctx.sink.log(event(
        "info",
        "hub",
        format!("{} ({}) disconnected", req.name, vpn_ip),
    ));
    tracing::info!("session for {} ended: {:?}", req.name, session_result);

    session_result
}

async fn read_handshake<C: Connection>(conn: &mut C) -> crate::Result<(u8, HandshakeRequest)> {
    let enc_flag = conn.read_byte().await?;
    if enc_flag > 1 {
        return Err(format!("bad enc_flag byte: {:#04x}", enc_flag).into());
    }
    let payload = conn.read_frame().await?;
    let req = Parser::decode_handshake(&payload)?;
    if req.name.is_empty() {
        return Err("handshake without a node name".into());
    }
    Ok((enc_flag, req))
}

/// Handle one inbound message. Returns false when the session should end.
async fn dispatch(
    ctx: &Arc<SessionCtx>,
    peer: &PeerHandle,
    probes: &PendingProbes,
    msg: TunnelMsg,
) -> bool {
    match msg {
        TunnelMsg::Data(data) => {
            if peer.state.get() != PeerState::Active {
                return true;
            }
            if data.invalid() || data.version() != 4 {
                tracing::warn!("dropping malformed packet from {}", peer.name);
                return true;
            }
            forward_packet(ctx, data).await
        }

        TunnelMsg::KeepAlive => true,

        TunnelMsg::TopologyAnnounce(snapshot) => {
            let mut graph = ctx.topology.lock().unwrap_or_else(|e| e.into_inner());
            graph.merge_announce(peer.vpn_ip, &snapshot);
            true
        }

        TunnelMsg::DisconnectIntent(reason) => {
            tracing::info!("{} disconnecting: {}", peer.name, reason);
            if let Err(e) = ctx
                .intent
                .set_disconnected_intentional(peer.vpn_ip, &reason)
            {
                tracing::error!("intent store write failed for {}: {}", peer.name, e);
                ctx.fatal.cancel();
                return false;
            }
            ctx.sink.log(event(
                "info",
                "hub",
                format!("{} disconnected intentionally: {}", peer.name, reason),
            ));
            peer.state.set(PeerState::Draining);
            false
        }

        // Hub → client only; a client sending it is ignored.
        TunnelMsg::ReconnectInvite(_) => true,

        TunnelMsg::LatencyProbe(token) => {
            peer.queue.push(TunnelMsg::LatencyEcho(token));
            true
        }

        TunnelMsg::LatencyEcho(token) => {
            if let Some(rtt_ms) = resolve_probe(probes, &token) {
                let mut graph = ctx.topology.lock().unwrap_or_else(|e| e.into_inner());
                graph.update_latency(peer.vpn_ip, rtt_ms);
            }
            true
        }

        TunnelMsg::RouteState(route_all) => {
            tracing::info!("{} toggled route-all to {}", peer.name, route_all);
            if let Err(e) = ctx.intent.set_route_all(peer.vpn_ip, route_all) {
                tracing::error!("intent store write failed for {}: {}", peer.name, e);
                ctx.fatal.cancel();
                return false;
            }
            true
        }
    }
}

/// Destination-based dispatch shared with the hub's TUN read loop.
pub(crate) async fn forward_packet(ctx: &SessionCtx, data: DataMsg) -> bool {
    let dst = data.dst();

    if dst == ctx.hub_vpn {
        if ctx.to_device.send(data.payload).await.is_err() {
            tracing::error!("tun device gone, cannot deliver packet");
            ctx.fatal.cancel();
            return false;
        }
        return true;
    }

    if let Some(target) = ctx.table.lookup(dst) {
        if target.state.get() == PeerState::Active {
            target.queue.push(TunnelMsg::Data(data));
        } else {
            ctx.table.no_route_drops.fetch_add(1, Ordering::Relaxed);
        }
        return true;
    }

    if !ctx.subnet.contains(&dst) {
        // Leaves the mesh through the hub's interface; the host routes it on.
        if ctx.to_device.send(data.payload).await.is_err() {
            ctx.fatal.cancel();
            return false;
        }
        return true;
    }

    ctx.table.no_route_drops.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("no route to {}, packet dropped", dst);
    true
}
