//! The full client daemon against an in-process hub: handshake, packet
//! forwarding through a channel-backed device, and the user disconnect flow.

use ipnet::Ipv4Net;
use meshtun::client::client::{ClientCommand, ClientStatus, ConnState, VpnClient};
use meshtun::client::config::ClientConfig;
use meshtun::crypto;
use meshtun::hub::config::HubConfig;
use meshtun::hub::server::Hub;
use meshtun::identity::NodeIdentity;
use meshtun::intent::{ClientState, IntentStore};
use meshtun::netdev::device::DeviceHandler;
use meshtun::netdev::route_all::RouteController;
use meshtun::observe::{NullSink, Sink};
use meshtun::topology::{self, NodeInfo, TopologyGraph};
use meshtun::util::now_unix;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_KEY: [u8; 32] = [0u8; 32];

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 8, 0, last)
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 1;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

struct Rig {
    hub_addr: String,
    hub_tun_out: mpsc::Receiver<Vec<u8>>,
    // Keeps the hub's device read side open.
    _hub_tun_in: mpsc::Sender<Vec<u8>>,
    intent: Arc<IntentStore>,
    shutdown: CancellationToken,
}

async fn start_rig(data_dir: &Path) -> Rig {
    let subnet: Ipv4Net = "10.8.0.0/24".parse().unwrap();
    let intent = Arc::new(IntentStore::open(&data_dir.join("intent.db")).unwrap());
    let sink: Arc<dyn Sink> = Arc::new(NullSink);
    let shutdown = CancellationToken::new();

    let hub = Hub::new(
        HubConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            subnet,
            vpn_addr: ip(1),
            mtu: 1400,
            invite_window: Duration::from_secs(60),
        },
        crypto::aes_block(&TEST_KEY),
        intent.clone(),
        sink,
        &NodeIdentity::new("hub".to_string(), None),
        shutdown.clone(),
    )
    .unwrap();
    let acceptor = hub.bind().await.unwrap();
    let hub_addr = acceptor.local_addr().unwrap().to_string();

    let (hub_tun_in_tx, hub_tun_in_rx) = mpsc::channel(64);
    let (hub_tun_out_tx, hub_tun_out_rx) = mpsc::channel(64);
    let device = DeviceHandler::from_channels(hub_tun_in_rx, hub_tun_out_tx);
    tokio::spawn(async move {
        let _ = hub.serve(acceptor, device).await;
    });

    Rig {
        hub_addr,
        hub_tun_out: hub_tun_out_rx,
        _hub_tun_in: hub_tun_in_tx,
        intent,
        shutdown,
    }
}

#[tokio::test]
async fn client_daemon_connects_forwards_and_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = start_rig(dir.path()).await;

    let status = ClientStatus::new(rig.hub_addr.clone(), true);
    let (ctl_tx, ctl_rx) = mpsc::channel(4);
    let identity = NodeIdentity::new("c1".to_string(), None);
    let graph = topology::shared(TopologyGraph::new(
        Ipv4Addr::UNSPECIFIED,
        NodeInfo {
            name: identity.name.clone(),
            os: identity.os.clone(),
            version: identity.version.clone(),
            public_addr: None,
            distance: 0,
            latency_ms: None,
            last_seen: now_unix(),
            geo: None,
            is_direct: true,
        },
    ));

    // Channel-backed client TUN device: inject via client_tun_in, observe
    // writes on client_tun_out.
    let (client_tun_in_tx, client_tun_in_rx) = mpsc::channel(64);
    let (client_tun_out_tx, _client_tun_out_rx) = mpsc::channel::<Vec<u8>>(64);
    let device = DeviceHandler::from_channels(client_tun_in_rx, client_tun_out_tx);

    let cfg = ClientConfig {
        server_addr: rig.hub_addr.clone(),
        name: "c1".to_string(),
        route_all: false,
        encrypted: true,
        mtu: 1400,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        hub_vpn_addr: ip(1),
        auto_connect: true,
    };
    let client = VpnClient::new(
        cfg,
        crypto::aes_block(&TEST_KEY),
        identity,
        graph,
        Arc::new(NullSink),
        status.clone(),
        RouteController::new(dir.path()),
        ctl_rx,
        rig.shutdown.clone(),
    )
    .with_device(device, ip(2));

    let client_task = tokio::spawn(client.run());

    // Wait for Active.
    let mut active = false;
    for _ in 0..50 {
        if status.snapshot().state == ConnState::Active {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(active, "client reached Active");
    assert_eq!(status.snapshot().vpn_addr, Some(ip(2)));

    // A packet read from the client's TUN arrives on the hub's TUN.
    let ping = ipv4_packet(ip(2), ip(1), b"via the daemon");
    client_tun_in_tx.send(ping.clone()).await.unwrap();
    let seen = timeout(Duration::from_secs(2), rig.hub_tun_out.recv())
        .await
        .expect("packet within 2s")
        .unwrap();
    assert_eq!(seen, ping);

    // User disconnect: intent goes sticky on the hub, no auto-reconnect.
    let (reply_tx, reply_rx) = oneshot::channel();
    ctl_tx
        .send(ClientCommand::Disconnect {
            reason: "user request".to_string(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("disconnect reply in time")
        .unwrap();
    assert!(reply.is_ok());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = rig.intent.get(ip(2)).unwrap().expect("intent recorded");
    assert_eq!(record.state, ClientState::DisconnectedIntentional);
    assert_eq!(status.snapshot().state, ConnState::Disconnected);

    // A user connect command brings the tunnel back.
    let (reply_tx, reply_rx) = oneshot::channel();
    ctl_tx
        .send(ClientCommand::Connect {
            route_all: None,
            reply: reply_tx,
        })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(10), reply_rx)
        .await
        .expect("connect reply in time")
        .unwrap()
        .expect("connect succeeded");
    assert_eq!(
        reply.get("assigned_ip").and_then(|v| v.as_str()),
        Some("10.8.0.2"),
        "same address on reconnect"
    );

    rig.shutdown.cancel();
    let _ = timeout(Duration::from_secs(10), client_task).await;
}
