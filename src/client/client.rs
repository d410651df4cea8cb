//! Client daemon: dials the hub with exponential backoff, assumes the
//! assigned VPN address on a local TUN device, and pumps packets between the
//! device and the tunnel. Optionally redirects all host traffic through the
//! tunnel via the routing controller.

use crate::client::backoff::Backoff;
use crate::client::config::ClientConfig;
use crate::codec::errors::FrameError;
use crate::codec::frame::{DataMsg, HandshakeRequest, TunnelMsg};
use crate::codec::parser::Parser;
use crate::crypto::SharedBlock;
use crate::identity::NodeIdentity;
use crate::netdev::device::{DeviceConfig, DeviceHandler};
use crate::netdev::route_all::RouteController;
use crate::network::peer::{
    keepalive_loop, pending_probes, resolve_probe, writer_loop, PeerCounters, PendingProbes,
};
use crate::network::queue::FrameQueue;
use crate::network::tcp_transport::TcpTransport;
use crate::network::{self, Connection, HANDSHAKE_TIMEOUT, OUTBOUND_QUEUE_CAP, PROTOCOL_ERROR_LIMIT};
use crate::observe::{event, sample, Sink};
use crate::topology::{NodeInfo, SharedTopology};
use crate::util::now_unix;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Commands the control RPC sends into the running client.
pub enum ClientCommand {
    Connect {
        route_all: Option<bool>,
        reply: oneshot::Sender<crate::Result<serde_json::Value>>,
    },
    Disconnect {
        reason: String,
        reply: oneshot::Sender<crate::Result<serde_json::Value>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Active,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub state: ConnState,
    pub server: String,
    pub vpn_addr: Option<Ipv4Addr>,
    pub encrypted: bool,
    pub route_all: bool,
    pub last_error: Option<String>,
    pub next_retry_ms: Option<u64>,
    pub connected_at: Option<u64>,
}

/// Connection state shared with the control RPC and the status surface.
pub struct ClientStatus {
    info: Mutex<ConnInfo>,
    pub counters: Arc<PeerCounters>,
}

impl ClientStatus {
    pub fn new(server: String, encrypted: bool) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(ConnInfo {
                state: ConnState::Disconnected,
                server,
                vpn_addr: None,
                encrypted,
                route_all: false,
                last_error: None,
                next_retry_ms: None,
                connected_at: None,
            }),
            counters: Arc::new(PeerCounters::default()),
        })
    }

    pub fn snapshot(&self) -> ConnInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut ConnInfo)) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut info);
    }
}

enum ConnOutcome {
    PoolFull,
    Lost(String),
    UserDisconnect,
    Shutdown,
    /// Unrecoverable (the TUN device is gone); the daemon exits with code 2.
    Fatal(String),
}

pub struct VpnClient {
    cfg: ClientConfig,
    block: SharedBlock,
    identity: NodeIdentity,
    topology: SharedTopology,
    sink: Arc<dyn Sink>,
    status: Arc<ClientStatus>,
    route_ctl: RouteController,
    commands: mpsc::Receiver<ClientCommand>,
    shutdown: CancellationToken,
    device: Option<DeviceHandler>,
    device_addr: Option<Ipv4Addr>,
    route_all: bool,
    route_enabled: bool,
    auto_connect: bool,
    last_server_ip: Option<Ipv4Addr>,
    pending_reply: Option<oneshot::Sender<crate::Result<serde_json::Value>>>,
}

impl VpnClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ClientConfig,
        block: SharedBlock,
        identity: NodeIdentity,
        topology: SharedTopology,
        sink: Arc<dyn Sink>,
        status: Arc<ClientStatus>,
        route_ctl: RouteController,
        commands: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let route_all = cfg.route_all;
        let auto_connect = cfg.auto_connect;
        Self {
            cfg,
            block,
            identity,
            topology,
            sink,
            status,
            route_ctl,
            commands,
            shutdown,
            device: None,
            device_addr: None,
            route_all,
            route_enabled: false,
            auto_connect,
            last_server_ip: None,
            pending_reply: None,
        }
    }

    /// Preinstall a device instead of opening a real TUN interface. Used by
    /// tests; `addr` must match the address the hub will assign.
    pub fn with_device(mut self, device: DeviceHandler, addr: Ipv4Addr) -> Self {
        self.device = Some(device);
        self.device_addr = Some(addr);
        self
    }

    pub async fn run(mut self) -> crate::Result<()> {
        // A leftover snapshot means a previous run died with route-all on;
        // restore the host's default route before anything else.
        if self.route_ctl.is_enabled() {
            tracing::info!("restoring default route saved by a previous run");
            if let Err(e) = self.route_ctl.disable_route_all() {
                tracing::warn!("{}", e);
            }
        }

        let mut backoff = Backoff::default();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.auto_connect {
                self.status.update(|i| {
                    i.state = ConnState::Disconnected;
                    i.next_retry_ms = None;
                });
                tokio::select! {
                    cmd = self.commands.recv() => match cmd {
                        Some(ClientCommand::Connect { route_all, reply }) => {
                            if let Some(want) = route_all {
                                self.route_all = want;
                            }
                            self.auto_connect = true;
                            self.pending_reply = Some(reply);
                            backoff.reset();
                        }
                        Some(ClientCommand::Disconnect { reply, .. }) => {
                            let _ = reply.send(Ok(
                                serde_json::json!({"status": "already disconnected"}),
                            ));
                        }
                        None => break,
                    },
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            match self.connect_once(&mut backoff).await {
                Ok(ConnOutcome::UserDisconnect) => {
                    backoff.reset();
                    self.auto_connect = false;
                    continue;
                }
                Ok(ConnOutcome::Shutdown) => break,
                Ok(ConnOutcome::Fatal(reason)) => {
                    tracing::error!("{}", reason);
                    self.sink.log(event("error", "client", reason.clone()));
                    if self.route_enabled || self.route_ctl.is_enabled() {
                        if let Err(e) = self.route_ctl.disable_route_all() {
                            tracing::warn!("{}", e);
                        }
                    }
                    return Err(reason.into());
                }
                Ok(ConnOutcome::PoolFull) => {
                    tracing::warn!("hub address pool exhausted, retrying with backoff");
                    self.fail_pending("hub address pool exhausted");
                    self.status.update(|i| {
                        i.state = ConnState::Reconnecting;
                        i.last_error = Some("hub address pool exhausted".to_string());
                    });
                }
                Ok(ConnOutcome::Lost(reason)) => {
                    tracing::warn!("connection lost: {}, reconnecting", reason);
                    self.sink.log(event(
                        "warn",
                        "client",
                        format!("connection lost: {}", reason),
                    ));
                    self.status.update(|i| {
                        i.state = ConnState::Reconnecting;
                        i.last_error = Some(reason.clone());
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    tracing::warn!("dial {} failed: {}", self.cfg.server_addr, msg);
                    self.fail_pending(&msg);
                    self.status.update(|i| {
                        i.state = ConnState::Reconnecting;
                        i.last_error = Some(msg.clone());
                    });
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("next dial attempt in {:.1}s", delay.as_secs_f64());
            self.status
                .update(|i| i.next_retry_ms = Some(delay.as_millis() as u64));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::Connect { route_all, reply }) => {
                        if let Some(want) = route_all {
                            self.route_all = want;
                        }
                        self.pending_reply = Some(reply);
                        backoff.reset();
                    }
                    Some(ClientCommand::Disconnect { reply, .. }) => {
                        self.auto_connect = false;
                        let _ = reply.send(Ok(serde_json::json!({"status": "disconnected"})));
                    }
                    None => break,
                },
            }
        }

        if self.route_enabled || self.route_ctl.is_enabled() {
            if let Err(e) = self.route_ctl.disable_route_all() {
                tracing::warn!("{}", e);
            }
        }
        self.status.update(|i| i.state = ConnState::Disconnected);
        Ok(())
    }

    async fn connect_once(&mut self, backoff: &mut Backoff) -> crate::Result<ConnOutcome> {
        self.status.update(|i| i.state = ConnState::Connecting);
        tracing::info!("dialing {}", self.cfg.server_addr);

        let mut transport = network::dial(&self.cfg.server_addr).await?;
        let server_ip = transport.peer_addr().ok().and_then(|a| match a.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        });
        self.last_server_ip = server_ip;

        let request = HandshakeRequest {
            name: self.cfg.name.clone(),
            os: self.identity.os.clone(),
            arch: self.identity.arch.clone(),
            version: self.identity.version.clone(),
            public_addr_hint: self.identity.public_addr.clone(),
            route_all: self.route_all,
        };
        let enc_flag = if self.cfg.encrypted { 1u8 } else { 0u8 };
        if enc_flag == 0 {
            tracing::warn!("dialing a PLAINTEXT tunnel; traffic is not protected");
        }

        let assigned = match timeout(
            HANDSHAKE_TIMEOUT,
            exchange_handshake(&mut transport, enc_flag, &request),
        )
        .await
        {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                transport.close().await;
                return Err(e);
            }
            Err(_) => {
                transport.close().await;
                return Err("handshake timed out".into());
            }
        };

        if assigned.is_unspecified() {
            transport.close().await;
            return Ok(ConnOutcome::PoolFull);
        }

        backoff.reset();
        tracing::info!("handshake complete, assigned {}", assigned);
        self.sink.log(event(
            "info",
            "client",
            format!("connected to {} as {}", self.cfg.server_addr, assigned),
        ));

        self.ensure_device(assigned).await?;

        {
            let mut graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
            graph.rekey_self(assigned);
            graph.add_direct_peer(
                self.cfg.hub_vpn_addr,
                NodeInfo {
                    // Identity arrives with the hub's first announce.
                    name: String::new(),
                    os: String::new(),
                    version: String::new(),
                    public_addr: server_ip.map(|ip| ip.to_string()),
                    distance: -1,
                    latency_ms: None,
                    last_seen: now_unix(),
                    geo: None,
                    is_direct: true,
                },
            );
        }

        self.status.update(|i| {
            i.state = ConnState::Active;
            i.vpn_addr = Some(assigned);
            i.connected_at = Some(now_unix());
            i.last_error = None;
            i.next_retry_ms = None;
        });

        // Routing failures are surfaced to the connect caller (or the sink),
        // but the tunnel itself stays up.
        let route_result = if self.route_all {
            self.enable_routing()
        } else {
            Ok(())
        };
        if let Some(reply) = self.pending_reply.take() {
            let resp = match &route_result {
                Ok(()) => Ok(serde_json::json!({
                    "assigned_ip": assigned.to_string(),
                    "route_all": self.route_enabled,
                })),
                Err(e) => Err(crate::Error::from(e.to_string())),
            };
            let _ = reply.send(resp);
        } else if let Err(ref e) = route_result {
            tracing::error!("{}", e);
            self.sink.log(event("error", "client", e.to_string()));
        }

        Ok(self.run_connection(transport).await)
    }

    async fn run_connection(&mut self, transport: TcpTransport) -> ConnOutcome {
        let (mut reader, writer) = transport.split();
        let queue = Arc::new(FrameQueue::new(OUTBOUND_QUEUE_CAP));
        let counters = self.status.counters.clone();
        let last_activity = Arc::new(AtomicU64::new(now_unix()));
        let conn_token = self.shutdown.child_token();
        let probes = pending_probes();

        let writer_task = tokio::spawn(writer_loop(
            writer,
            queue.clone(),
            self.block.clone(),
            counters.clone(),
            conn_token.clone(),
        ));
        let keepalive_task = tokio::spawn(keepalive_loop(
            queue.clone(),
            last_activity.clone(),
            probes.clone(),
            conn_token.clone(),
        ));

        let Some(mut device) = self.device.take() else {
            conn_token.cancel();
            let _ = writer_task.await;
            keepalive_task.abort();
            return ConnOutcome::Fatal("no tun device installed".to_string());
        };
        let mut disconnect_reply: Option<oneshot::Sender<crate::Result<serde_json::Value>>> = None;
        let mut consecutive_errors: u32 = 0;
        let mut announce_ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
        announce_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        announce_ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = announce_ticker.tick() => {
                    let snapshot = {
                        let graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
                        graph.snapshot_for_export()
                    };
                    queue.push(TunnelMsg::TopologyAnnounce(snapshot));
                    let c = counters.snapshot();
                    self.sink.metric(sample("client.bytes_tx", c.bytes_tx as f64, None));
                    self.sink.metric(sample("client.bytes_rx", c.bytes_rx as f64, None));
                }

                packet = device.recv() => {
                    let Some(packet) = packet else {
                        break ConnOutcome::Fatal("tun device lost".to_string());
                    };
                    queue.push(TunnelMsg::Data(DataMsg { payload: packet }));
                }

                result = reader.read_frame() => {
                    let payload = match result {
                        Ok(payload) => payload,
                        Err(e) if e.downcast_ref::<FrameError>().is_some() => {
                            consecutive_errors += 1;
                            tracing::warn!(
                                "protocol error from hub ({}/{}): {}",
                                consecutive_errors, PROTOCOL_ERROR_LIMIT, e
                            );
                            if consecutive_errors >= PROTOCOL_ERROR_LIMIT {
                                break ConnOutcome::Lost(
                                    "protocol error threshold exceeded".to_string(),
                                );
                            }
                            continue;
                        }
                        Err(e) => break ConnOutcome::Lost(e.to_string()),
                    };
                    counters.record_rx(payload.len());
                    last_activity.store(now_unix(), Ordering::Relaxed);

                    match Parser::unmarshal(payload, self.block.as_ref().as_ref()) {
                        Ok(Some(msg)) => {
                            consecutive_errors = 0;
                            if let Err(e) =
                                self.handle_msg(msg, &queue, &probes, &mut device).await
                            {
                                // The only error path in here is a dead device.
                                break ConnOutcome::Fatal(e.to_string());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            consecutive_errors += 1;
                            tracing::warn!(
                                "protocol error from hub ({}/{}): {}",
                                consecutive_errors, PROTOCOL_ERROR_LIMIT, e
                            );
                            if consecutive_errors >= PROTOCOL_ERROR_LIMIT {
                                break ConnOutcome::Lost(
                                    "protocol error threshold exceeded".to_string(),
                                );
                            }
                        }
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::Disconnect { reason, reply }) => {
                        tracing::info!("user disconnect: {}", reason);
                        queue.push(TunnelMsg::DisconnectIntent(reason));
                        disconnect_reply = Some(reply);
                        break ConnOutcome::UserDisconnect;
                    }
                    Some(ClientCommand::Connect { route_all, reply }) => {
                        let resp = self.apply_route_toggle(route_all, &queue);
                        let _ = reply.send(resp);
                    }
                    None => break ConnOutcome::Shutdown,
                },

                _ = conn_token.cancelled() => {
                    break if self.shutdown.is_cancelled() {
                        ConnOutcome::Shutdown
                    } else {
                        ConnOutcome::Lost("connection closed".to_string())
                    };
                }
            }
        };

        // The writer flushes the send queue within the drain budget; the
        // DISCONNECT_INTENT pushed above rides out with it.
        conn_token.cancel();
        let _ = writer_task.await;
        keepalive_task.abort();
        self.device = Some(device);

        {
            let mut graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
            graph.remove_peer(self.cfg.hub_vpn_addr);
        }

        if let ConnOutcome::UserDisconnect = outcome {
            self.disable_routing();
            self.status.update(|i| {
                i.state = ConnState::Disconnected;
                i.route_all = false;
                i.connected_at = None;
            });
            self.sink
                .log(event("info", "client", "disconnected by user request"));
            if let Some(reply) = disconnect_reply {
                let _ = reply.send(Ok(serde_json::json!({"status": "disconnected"})));
            }
        }

        outcome
    }

    async fn handle_msg(
        &mut self,
        msg: TunnelMsg,
        queue: &Arc<FrameQueue>,
        probes: &PendingProbes,
        device: &mut DeviceHandler,
    ) -> crate::Result<()> {
        match msg {
            TunnelMsg::Data(data) => {
                if data.invalid() || data.version() != 4 {
                    return Ok(());
                }
                device.send(data.payload).await?;
            }

            TunnelMsg::KeepAlive => {}

            TunnelMsg::TopologyAnnounce(snapshot) => {
                let mut graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
                graph.merge_announce(self.cfg.hub_vpn_addr, &snapshot);
            }

            TunnelMsg::ReconnectInvite(_) => {
                tracing::info!("hub invited us to re-enable routing");
                self.route_all = true;
                match self.enable_routing() {
                    Ok(()) => {
                        queue.push(TunnelMsg::RouteState(true));
                    }
                    Err(e) => {
                        tracing::error!("invite accepted but routing failed: {}", e);
                        self.sink.log(event("error", "client", e.to_string()));
                    }
                }
            }

            TunnelMsg::LatencyProbe(token) => {
                queue.push(TunnelMsg::LatencyEcho(token));
            }

            TunnelMsg::LatencyEcho(token) => {
                if let Some(rtt_ms) = resolve_probe(probes, &token) {
                    let mut graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
                    graph.update_latency(self.cfg.hub_vpn_addr, rtt_ms);
                }
            }

            // Hub never sends these; drop.
            TunnelMsg::DisconnectIntent(_) | TunnelMsg::RouteState(_) => {}
        }
        Ok(())
    }

    async fn ensure_device(&mut self, addr: Ipv4Addr) -> crate::Result<()> {
        if self.device.is_some() {
            if self.device_addr == Some(addr) {
                return Ok(());
            }
            tracing::info!("assigned address changed to {}, recreating device", addr);
            self.device = None;
        }
        let device = DeviceHandler::open(DeviceConfig {
            address: addr,
            netmask: self.cfg.netmask,
            mtu: self.cfg.mtu,
        })
        .await?;
        self.device = Some(device);
        self.device_addr = Some(addr);
        Ok(())
    }

    fn enable_routing(&mut self) -> crate::Result<()> {
        if self.route_enabled {
            return Ok(());
        }
        let server_ip = self
            .last_server_ip
            .ok_or("routing: hub address is not IPv4")?;
        self.route_ctl
            .enable_route_all(self.cfg.hub_vpn_addr, server_ip)
            .map_err(|e| -> crate::Error { Box::new(e) })?;
        self.route_enabled = true;
        self.status.update(|i| i.route_all = true);
        Ok(())
    }

    fn disable_routing(&mut self) {
        if !self.route_enabled && !self.route_ctl.is_enabled() {
            return;
        }
        match self.route_ctl.disable_route_all() {
            Ok(()) => {
                self.route_enabled = false;
                self.status.update(|i| i.route_all = false);
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn apply_route_toggle(
        &mut self,
        route_all: Option<bool>,
        queue: &Arc<FrameQueue>,
    ) -> crate::Result<serde_json::Value> {
        let Some(want) = route_all else {
            return Ok(serde_json::json!({"status": "already connected"}));
        };
        if want == self.route_enabled {
            self.route_all = want;
            return Ok(serde_json::json!({"route_all": want}));
        }

        if want {
            self.route_all = true;
            self.enable_routing()?;
        } else {
            self.route_all = false;
            self.route_ctl
                .disable_route_all()
                .map_err(|e| -> crate::Error { Box::new(e) })?;
            self.route_enabled = false;
            self.status.update(|i| i.route_all = false);
        }
        queue.push(TunnelMsg::RouteState(want));
        Ok(serde_json::json!({"route_all": want}))
    }

    fn fail_pending(&mut self, msg: &str) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(msg.to_string().into()));
        }
    }
}

/// Dialer side of the handshake: `enc_flag` byte, handshake JSON frame, then
/// the acceptor's assigned-IP reply.
async fn exchange_handshake<C: Connection>(
    conn: &mut C,
    enc_flag: u8,
    request: &HandshakeRequest,
) -> crate::Result<Ipv4Addr> {
    conn.write_byte(enc_flag).await?;
    conn.write_frame(&Parser::encode_handshake(request)?).await?;
    let reply = conn.read_frame().await?;
    Parser::decode_assigned_ip(&reply)
}
