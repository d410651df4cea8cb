//! Hub daemon: accepts tunnels, relays IPv4 between clients, replays
//! reconnect invites after a restart.

use crate::codec::frame::{DataMsg, TunnelMsg};
use crate::crypto::SharedBlock;
use crate::hub::config::HubConfig;
use crate::hub::forwarding::ForwardingTable;
use crate::hub::handler::{run_session, SessionCtx};
use crate::hub::ip_alloc::IpAllocator;
use crate::identity::NodeIdentity;
use crate::intent::IntentStore;
use crate::netdev::device::DeviceHandler;
use crate::network::peer::PeerState;
use crate::network::tcp_listener::Acceptor;
use crate::network::DRAIN_TIMEOUT;
use crate::observe::{sample, Sink};
use crate::topology::{self, NodeInfo, SharedTopology, TopologyGraph, NODE_LIVENESS_SECS};
use crate::util::now_unix;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const DEVICE_CHANNEL_CAP: usize = 1000;

/// Clients owed a RECONNECT_INVITE, valid until the window closes.
///
/// Built from the intent store's `connected_routing` records when the hub
/// starts listening. A client is invited at most once per restart.
pub struct InviteRoster {
    deadline: Instant,
    names: Mutex<HashSet<String>>,
}

impl InviteRoster {
    pub fn new(names: HashSet<String>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline: Instant::now() + window,
            names: Mutex::new(names),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(HashSet::new(), Duration::ZERO)
    }

    /// Consume the pending invite for `name`, if one exists and the window
    /// has not closed.
    pub fn take(&self, name: &str) -> bool {
        if Instant::now() > self.deadline {
            return false;
        }
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }
}

/// Push the current topology snapshot to every active peer.
pub(crate) fn broadcast_topology(table: &ForwardingTable, topology: &SharedTopology) {
    let snapshot = {
        let graph = topology.lock().unwrap_or_else(|e| e.into_inner());
        graph.snapshot_for_export()
    };
    for peer in table.peers() {
        if peer.state.get() == PeerState::Active {
            peer.queue.push(TunnelMsg::TopologyAnnounce(snapshot.clone()));
        }
    }
}

pub struct Hub {
    cfg: HubConfig,
    aes: SharedBlock,
    table: Arc<ForwardingTable>,
    intent: Arc<IntentStore>,
    topology: SharedTopology,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    invite_names: HashSet<String>,
}

impl Hub {
    pub fn new(
        cfg: HubConfig,
        aes: SharedBlock,
        intent: Arc<IntentStore>,
        sink: Arc<dyn Sink>,
        identity: &NodeIdentity,
        shutdown: CancellationToken,
    ) -> crate::Result<Self> {
        let mut alloc = IpAllocator::new(cfg.subnet, cfg.vpn_addr);
        for record in intent.all()? {
            alloc.seed_preference(&record.node_name, record.vpn_address);
        }
        let table = Arc::new(ForwardingTable::new(alloc));

        let topology = topology::shared(TopologyGraph::new(
            cfg.vpn_addr,
            NodeInfo {
                name: identity.name.clone(),
                os: identity.os.clone(),
                version: identity.version.clone(),
                public_addr: identity.public_addr.clone(),
                distance: 0,
                latency_ms: None,
                last_seen: now_unix(),
                geo: None,
                is_direct: true,
            },
        ));

        let invite_names: HashSet<String> = intent
            .clients_for_invite()?
            .into_iter()
            .map(|r| r.node_name)
            .collect();
        if !invite_names.is_empty() {
            tracing::info!(
                "{} routed client(s) eligible for reconnect invites",
                invite_names.len()
            );
        }

        Ok(Self {
            cfg,
            aes,
            table,
            intent,
            topology,
            sink,
            shutdown,
            fatal: CancellationToken::new(),
            invite_names,
        })
    }

    pub fn table(&self) -> Arc<ForwardingTable> {
        self.table.clone()
    }

    pub fn topology(&self) -> SharedTopology {
        self.topology.clone()
    }

    pub fn intent(&self) -> Arc<IntentStore> {
        self.intent.clone()
    }

    /// Bind the listening socket. Separated from [`Hub::serve`] so binding
    /// failures surface as startup errors (exit 1), not steady-state ones.
    pub async fn bind(&self) -> crate::Result<Acceptor> {
        Acceptor::bind(&self.cfg.listen_addr).await
    }

    /// Run the accept loop, TUN pump, and announce ticker until shutdown.
    /// An error return means unrecoverable steady-state failure.
    pub async fn serve(&self, acceptor: Acceptor, device: DeviceHandler) -> crate::Result<()> {
        let (to_device_tx, to_device_rx) = mpsc::channel::<Vec<u8>>(DEVICE_CHANNEL_CAP);

        let ctx = Arc::new(SessionCtx {
            table: self.table.clone(),
            intent: self.intent.clone(),
            topology: self.topology.clone(),
            sink: self.sink.clone(),
            aes: self.aes.clone(),
            to_device: to_device_tx,
            invites: InviteRoster::new(self.invite_names.clone(), self.cfg.invite_window),
            hub_vpn: self.cfg.vpn_addr,
            subnet: self.cfg.subnet,
            fatal: self.fatal.clone(),
            shutdown: self.shutdown.clone(),
        });

        let device_task = tokio::spawn(device_loop(
            device,
            to_device_rx,
            self.table.clone(),
            self.fatal.clone(),
            self.shutdown.clone(),
        ));
        let announce_task = tokio::spawn(announce_loop(
            self.table.clone(),
            self.topology.clone(),
            self.sink.clone(),
            self.shutdown.clone(),
        ));

        let result = loop {
            tokio::select! {
                conn = acceptor.accept() => {
                    match conn {
                        Ok(transport) => {
                            let ctx = ctx.clone();
                            tokio::task::spawn(async move {
                                let peer = transport.peer_addr();
                                let e = run_session(ctx, transport).await;
                                tracing::debug!("session from {:?} ended with {:?}", peer, e);
                            });
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = self.fatal.cancelled() => {
                    break Err("unrecoverable daemon error, shutting down".into());
                }
                _ = self.shutdown.cancelled() => break Ok(()),
            }
        };

        // Drain every connection: sessions observe the shutdown token through
        // their child tokens and flush within the drain budget.
        for peer in self.table.peers() {
            peer.state.set(PeerState::Draining);
        }
        self.shutdown.cancel();
        tokio::time::sleep(DRAIN_TIMEOUT).await;
        announce_task.abort();
        device_task.abort();

        result
    }
}

/// Hub TUN pump: packets read from the device are forwarded by destination
/// lookup; packets handed over by sessions are written out.
async fn device_loop(
    mut device: DeviceHandler,
    mut to_device_rx: mpsc::Receiver<Vec<u8>>,
    table: Arc<ForwardingTable>,
    fatal: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            packet = device.recv() => {
                let Some(packet) = packet else {
                    tracing::error!("tun device lost");
                    fatal.cancel();
                    break;
                };
                let data = DataMsg { payload: packet };
                if data.invalid() || data.version() != 4 {
                    continue;
                }
                let dst = data.dst();
                match table.lookup(dst) {
                    Some(peer) if peer.state.get() == PeerState::Active => {
                        peer.queue.push(TunnelMsg::Data(data));
                    }
                    _ => {
                        table.no_route_drops.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("no peer for {}, packet dropped", dst);
                    }
                }
            }
            packet = to_device_rx.recv() => {
                let Some(packet) = packet else { break };
                if device.send(packet).await.is_err() {
                    tracing::error!("tun device lost");
                    fatal.cancel();
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Periodic topology export to every peer, plus graph pruning and a peer
/// count metric.
async fn announce_loop(
    table: Arc<ForwardingTable>,
    topology: SharedTopology,
    sink: Arc<dyn Sink>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                {
                    let mut graph = topology.lock().unwrap_or_else(|e| e.into_inner());
                    graph.prune(NODE_LIVENESS_SECS);
                }
                broadcast_topology(&table, &topology);
                sink.metric(sample("hub.peers", table.len() as f64, None));
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
