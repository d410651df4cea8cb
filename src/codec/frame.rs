//! Tunnel message definitions.
//!
//! Every stream carries length-prefixed frames: a 4-byte big-endian length N
//! followed by N bytes of payload, N ≤ 65535. A connection's first exchange is
//! the handshake (plaintext): the dialer sends one raw `enc_flag` byte and a
//! frame holding a JSON [`HandshakeRequest`]; the acceptor answers with a
//! frame holding the ASCII dotted-quad VPN address it assigned.
//!
//! After the handshake every frame payload is (optionally sealed) plaintext of
//! the form `discriminator(1) || body`:
//!
//! - `0x00` IPv4 data: body is a complete IPv4 datagram
//! - `0x01` KEEPALIVE: empty body
//! - `0x02` TOPOLOGY_ANNOUNCE: JSON snapshot of nodes and edges
//! - `0x03` DISCONNECT_INTENT: UTF-8 reason
//! - `0x04` RECONNECT_INVITE: optional JSON metadata
//! - `0x05` LATENCY_PROBE: 8-byte opaque token
//! - `0x06` LATENCY_ECHO: echoed token
//! - `0x07` ROUTE_STATE: JSON `{"route_all": bool}`
//!
//! Unknown discriminators are dropped silently for forward compatibility.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::Ipv4Addr;

/// Frame length-prefix size in bytes.
pub const LEN_PREFIX: usize = 4;

/// Maximum frame payload length.
pub const MAX_FRAME_LEN: usize = 65535;

pub const DISC_DATA: u8 = 0x00;
pub const DISC_KEEPALIVE: u8 = 0x01;
pub const DISC_TOPOLOGY_ANNOUNCE: u8 = 0x02;
pub const DISC_DISCONNECT_INTENT: u8 = 0x03;
pub const DISC_RECONNECT_INVITE: u8 = 0x04;
pub const DISC_LATENCY_PROBE: u8 = 0x05;
pub const DISC_LATENCY_ECHO: u8 = 0x06;
pub const DISC_ROUTE_STATE: u8 = 0x07;

/// Assigned-IP reply the acceptor sends when the address pool is empty. The
/// dialer treats it as "pool full" and retries with backoff.
pub const POOL_EXHAUSTED_ADDR: &str = "0.0.0.0";

/// A decoded post-handshake tunnel message.
#[derive(Debug, Clone)]
pub enum TunnelMsg {
    /// Tunneled IPv4 datagram.
    Data(DataMsg),
    /// Connection health heartbeat.
    KeepAlive,
    /// Peer-announced snapshot of its topology view.
    TopologyAnnounce(TopologySnapshot),
    /// The user asked this peer to disconnect; payload is the reason.
    DisconnectIntent(String),
    /// Hub → client: re-enable routing immediately (sent after hub restarts
    /// to clients whose last recorded intent was connected-with-routing).
    ReconnectInvite(Option<serde_json::Value>),
    /// Round-trip measurement request carrying an opaque token.
    LatencyProbe([u8; 8]),
    /// Echoed probe token.
    LatencyEcho([u8; 8]),
    /// Client → hub: the user toggled route-all at runtime.
    RouteState(bool),
}

impl TunnelMsg {
    /// Control frames are never shed by the outbound queue; data frames are.
    pub fn is_control(&self) -> bool {
        !matches!(self, TunnelMsg::Data(_))
    }
}

impl Display for TunnelMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelMsg::Data(m) => write!(f, "data with payload size {}", m.payload.len()),
            TunnelMsg::KeepAlive => write!(f, "keepalive"),
            TunnelMsg::TopologyAnnounce(s) => {
                write!(f, "topology announce, {} nodes {} edges", s.nodes.len(), s.edges.len())
            }
            TunnelMsg::DisconnectIntent(reason) => write!(f, "disconnect intent: {}", reason),
            TunnelMsg::ReconnectInvite(_) => write!(f, "reconnect invite"),
            TunnelMsg::LatencyProbe(_) => write!(f, "latency probe"),
            TunnelMsg::LatencyEcho(_) => write!(f, "latency echo"),
            TunnelMsg::RouteState(on) => write!(f, "route state {}", on),
        }
    }
}

/// First two frames from the dialer, as a JSON object. `route_all` tells the
/// hub which connected intent state to record; absent means false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub name: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_addr_hint: Option<String>,
    #[serde(default)]
    pub route_all: bool,
}

/// Wire form of a topology view, exchanged in TOPOLOGY_ANNOUNCE frames.
/// Distances are never announced; each node recomputes them locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeEntry>,
    pub edges: Vec<EdgeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub addr: String,
    pub name: String,
    pub os: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Unix seconds of the announcer's last contact with this node.
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeEntry {
    pub a: String,
    pub b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_bps: Option<u64>,
    #[serde(default)]
    pub direct: bool,
}

/// Runtime route-all toggle, body of a ROUTE_STATE frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStateMsg {
    pub route_all: bool,
}

/// A tunneled IPv4 datagram.
#[derive(Debug, Clone)]
pub struct DataMsg {
    pub payload: Vec<u8>,
}

impl DataMsg {
    /// A valid IPv4 packet carries at least the 20-byte fixed header.
    pub fn invalid(&self) -> bool {
        self.payload.len() < 20
    }

    /// IP version nibble from the first header byte.
    pub fn version(&self) -> u8 {
        self.payload[0] >> 4
    }

    /// Destination address, header bytes 16..20.
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.payload[16],
            self.payload[17],
            self.payload[18],
            self.payload[19],
        )
    }

    /// Source address, header bytes 12..16.
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.payload[12],
            self.payload[13],
            self.payload[14],
            self.payload[15],
        )
    }
}
