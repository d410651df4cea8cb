//! End-to-end tunnel scenarios against an in-process hub on loopback TCP.
//!
//! The hub runs with a channel-backed TUN device, so the tests observe
//! exactly what the hub would read from and write to its interface. Clients
//! are driven raw over the wire protocol. The shared AES-256 key is 32 zero
//! bytes for determinism.

use ipnet::Ipv4Net;
use meshtun::codec::frame::{DataMsg, HandshakeRequest, TunnelMsg};
use meshtun::codec::parser::Parser;
use meshtun::crypto::{self, SharedBlock};
use meshtun::hub::config::HubConfig;
use meshtun::hub::server::Hub;
use meshtun::identity::NodeIdentity;
use meshtun::intent::{ClientState, IntentStore};
use meshtun::netdev::device::DeviceHandler;
use meshtun::network::{self, tcp_transport::TcpTransport};
use meshtun::observe::{NullSink, Sink};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_KEY: [u8; 32] = [0u8; 32];

struct TestHub {
    addr: String,
    /// Inject a packet as if the hub's TUN device read it.
    tun_inject: mpsc::Sender<Vec<u8>>,
    /// Packets the hub wrote to its TUN device.
    tun_out: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
    serve_task: tokio::task::JoinHandle<()>,
}

impl TestHub {
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.serve_task.await;
    }
}

async fn start_hub(data_dir: &Path, subnet: &str) -> TestHub {
    let subnet: Ipv4Net = subnet.parse().unwrap();
    let hub_vpn = subnet.hosts().next().unwrap();
    let intent = Arc::new(IntentStore::open(&data_dir.join("intent.db")).unwrap());
    let sink: Arc<dyn Sink> = Arc::new(NullSink);
    let identity = NodeIdentity::new("hub".to_string(), None);
    let shutdown = CancellationToken::new();

    let hub = Hub::new(
        HubConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            subnet,
            vpn_addr: hub_vpn,
            mtu: 1400,
            invite_window: Duration::from_secs(60),
        },
        crypto::aes_block(&TEST_KEY),
        intent,
        sink,
        &identity,
        shutdown.clone(),
    )
    .unwrap();

    let acceptor = hub.bind().await.unwrap();
    let addr = acceptor.local_addr().unwrap().to_string();

    let (tun_inject_tx, tun_inject_rx) = mpsc::channel(64);
    let (tun_out_tx, tun_out_rx) = mpsc::channel(64);
    let device = DeviceHandler::from_channels(tun_inject_rx, tun_out_tx);

    let serve_task = tokio::spawn(async move {
        let _ = hub.serve(acceptor, device).await;
    });

    TestHub {
        addr,
        tun_inject: tun_inject_tx,
        tun_out: tun_out_rx,
        shutdown,
        serve_task,
    }
}

struct FakeClient {
    transport: TcpTransport,
    block: SharedBlock,
    assigned: Ipv4Addr,
}

impl FakeClient {
    async fn connect(addr: &str, name: &str, route_all: bool) -> FakeClient {
        let mut transport = network::dial(addr).await.expect("dial hub");
        transport.write_byte(1).await.unwrap();
        let request = HandshakeRequest {
            name: name.to_string(),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            version: "0.3.0".to_string(),
            public_addr_hint: None,
            route_all,
        };
        transport
            .write_frame(&Parser::encode_handshake(&request).unwrap())
            .await
            .unwrap();
        let reply = timeout(Duration::from_secs(5), transport.read_frame())
            .await
            .expect("assigned-ip frame in time")
            .unwrap();
        let assigned = Parser::decode_assigned_ip(&reply).unwrap();
        FakeClient {
            transport,
            block: crypto::aes_block(&TEST_KEY),
            assigned,
        }
    }

    async fn send(&mut self, msg: TunnelMsg) {
        let framed = Parser::marshal(msg, self.block.as_ref().as_ref()).unwrap();
        self.transport.write_raw(&framed).await.unwrap();
    }

    async fn recv(&mut self) -> Option<TunnelMsg> {
        loop {
            let payload = self.transport.read_frame().await.ok()?;
            match Parser::unmarshal(payload, self.block.as_ref().as_ref()) {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Collect every message that arrives within the window.
    async fn drain_for(&mut self, window: Duration) -> Vec<TunnelMsg> {
        let mut messages = Vec::new();
        loop {
            match timeout(window, self.recv()).await {
                Ok(Some(msg)) => messages.push(msg),
                _ => return messages,
            }
        }
    }
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 1; // icmp
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 8, 0, last)
}

#[tokio::test]
async fn basic_tunnel_reaches_hub_tun() {
    let dir = tempfile::tempdir().unwrap();
    let mut hub = start_hub(dir.path(), "10.8.0.0/24").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;
    assert_eq!(c1.assigned, ip(2), "lowest free address");

    let ping = ipv4_packet(c1.assigned, ip(1), b"echo-request");
    c1.send(TunnelMsg::Data(DataMsg {
        payload: ping.clone(),
    }))
    .await;

    let seen = timeout(Duration::from_secs(2), hub.tun_out.recv())
        .await
        .expect("packet within 2s")
        .expect("device open");
    assert_eq!(seen, ping, "hub TUN sees the packet byte-for-byte");

    hub.stop().await;
}

#[tokio::test]
async fn hub_relays_between_clients_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let hub = start_hub(dir.path(), "10.8.0.0/24").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;
    let mut c2 = FakeClient::connect(&hub.addr, "c2", false).await;
    assert_eq!(c1.assigned, ip(2));
    assert_eq!(c2.assigned, ip(3));

    let datagram = ipv4_packet(c1.assigned, c2.assigned, b"hello c2");
    c1.send(TunnelMsg::Data(DataMsg {
        payload: datagram.clone(),
    }))
    .await;

    let received = c2.drain_for(Duration::from_millis(800)).await;
    let data_frames: Vec<_> = received
        .iter()
        .filter_map(|m| match m {
            TunnelMsg::Data(d) => Some(&d.payload),
            _ => None,
        })
        .collect();
    assert_eq!(data_frames.len(), 1, "delivered exactly once");
    assert_eq!(*data_frames[0], datagram);

    hub.stop().await;
}

#[tokio::test]
async fn hub_tun_packets_reach_clients() {
    let dir = tempfile::tempdir().unwrap();
    let hub = start_hub(dir.path(), "10.8.0.0/24").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;
    let datagram = ipv4_packet(ip(1), c1.assigned, b"from the hub side");
    hub.tun_inject.send(datagram.clone()).await.unwrap();

    let received = c1.drain_for(Duration::from_millis(800)).await;
    assert!(received.iter().any(|m| matches!(
        m,
        TunnelMsg::Data(d) if d.payload == datagram
    )));

    hub.stop().await;
}

#[tokio::test]
async fn routing_intent_survives_restart_with_invite() {
    let dir = tempfile::tempdir().unwrap();

    let hub = start_hub(dir.path(), "10.8.0.0/24").await;
    let c1 = FakeClient::connect(&hub.addr, "c1", true).await;
    assert_eq!(c1.assigned, ip(2));
    // Let the intent write land before the "crash".
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(c1);
    hub.stop().await;

    let hub = start_hub(dir.path(), "10.8.0.0/24").await;
    let mut c1 = FakeClient::connect(&hub.addr, "c1", true).await;
    assert_eq!(c1.assigned, ip(2), "same address across restart");

    let first = timeout(Duration::from_secs(2), c1.recv())
        .await
        .expect("first control frame in time")
        .expect("frame decodes");
    assert!(
        matches!(first, TunnelMsg::ReconnectInvite(_)),
        "first post-handshake frame must be RECONNECT_INVITE, got {}",
        first
    );

    hub.stop().await;
}

#[tokio::test]
async fn user_disconnect_is_sticky_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    let hub = start_hub(dir.path(), "10.8.0.0/24").await;
    let mut c1 = FakeClient::connect(&hub.addr, "c1", true).await;
    c1.send(TunnelMsg::DisconnectIntent("user request".to_string()))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(c1);
    hub.stop().await;

    let store = IntentStore::open(&dir.path().join("intent.db")).unwrap();
    let record = store.get(ip(2)).unwrap().expect("record exists");
    assert_eq!(record.state, ClientState::DisconnectedIntentional);
    drop(store);

    let hub = start_hub(dir.path(), "10.8.0.0/24").await;
    let mut c1 = FakeClient::connect(&hub.addr, "c1", true).await;
    let received = c1.drain_for(Duration::from_millis(500)).await;
    assert!(
        !received
            .iter()
            .any(|m| matches!(m, TunnelMsg::ReconnectInvite(_))),
        "no invite after an intentional disconnect"
    );

    hub.stop().await;
}

#[tokio::test]
async fn pool_exhaustion_rejects_second_client_only() {
    let dir = tempfile::tempdir().unwrap();
    // /30 leaves exactly one usable client address beside the hub.
    let mut hub = start_hub(dir.path(), "10.8.0.0/30").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;
    assert_eq!(c1.assigned, ip(2));

    let c2 = FakeClient::connect(&hub.addr, "c2", false).await;
    assert!(c2.assigned.is_unspecified(), "pool-full sentinel 0.0.0.0");

    // The first client's tunnel is unaffected.
    let ping = ipv4_packet(c1.assigned, ip(1), b"still alive");
    c1.send(TunnelMsg::Data(DataMsg {
        payload: ping.clone(),
    }))
    .await;
    let seen = timeout(Duration::from_secs(2), hub.tun_out.recv())
        .await
        .expect("packet within 2s")
        .unwrap();
    assert_eq!(seen, ping);

    hub.stop().await;
}

#[tokio::test]
async fn tampered_frame_is_dropped_next_frame_delivers() {
    let dir = tempfile::tempdir().unwrap();
    let mut hub = start_hub(dir.path(), "10.8.0.0/24").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;

    // A valid sealed frame with one ciphertext bit flipped in transit.
    let victim = ipv4_packet(c1.assigned, ip(1), b"tamper me");
    let mut framed = Parser::marshal(
        TunnelMsg::Data(DataMsg { payload: victim }),
        c1.block.as_ref().as_ref(),
    )
    .unwrap();
    let idx = framed.len() - 3;
    framed[idx] ^= 0x01;
    c1.transport.write_raw(&framed).await.unwrap();

    // The connection survives; the next valid frame still delivers.
    let ping = ipv4_packet(c1.assigned, ip(1), b"authentic");
    c1.send(TunnelMsg::Data(DataMsg {
        payload: ping.clone(),
    }))
    .await;

    let seen = timeout(Duration::from_secs(2), hub.tun_out.recv())
        .await
        .expect("valid packet within 2s")
        .unwrap();
    assert_eq!(seen, ping, "tampered frame dropped, valid one delivered");

    hub.stop().await;
}

#[tokio::test]
async fn latency_probe_echoes_token() {
    let dir = tempfile::tempdir().unwrap();
    let hub = start_hub(dir.path(), "10.8.0.0/24").await;

    let mut c1 = FakeClient::connect(&hub.addr, "c1", false).await;
    let token = [7u8, 6, 5, 4, 3, 2, 1, 0];
    c1.send(TunnelMsg::LatencyProbe(token)).await;

    let received = c1.drain_for(Duration::from_millis(800)).await;
    assert!(received
        .iter()
        .any(|m| matches!(m, TunnelMsg::LatencyEcho(t) if *t == token)));

    hub.stop().await;
}
