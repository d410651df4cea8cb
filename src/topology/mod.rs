//! Per-node topology view.
//!
//! Nodes are keyed by VPN IP, edges are undirected and stored under a
//! canonical ordered key. "Us" always exists with distance 0; after any
//! mutation every reachable node's distance equals its BFS depth from us and
//! unreachable nodes carry −1 until the liveness timeout prunes them.

use crate::codec::frame::{EdgeEntry, NodeEntry, TopologySnapshot};
use crate::util::now_unix;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Nodes unseen for this long are dropped once unreachable.
pub const NODE_LIVENESS_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub os: String,
    pub version: String,
    pub public_addr: Option<String>,
    /// BFS hop distance from us; −1 when unreachable.
    pub distance: i32,
    pub latency_ms: Option<f64>,
    pub last_seen: u64,
    pub geo: Option<String>,
    /// True while we hold a live tunnel to this node.
    pub is_direct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeInfo {
    pub latency_ms: Option<f64>,
    pub bandwidth_bps: Option<u64>,
    pub direct: bool,
}

fn edge_key(a: Ipv4Addr, b: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    if a <= b { (a, b) } else { (b, a) }
}

pub struct TopologyGraph {
    us: Ipv4Addr,
    nodes: HashMap<Ipv4Addr, NodeInfo>,
    edges: HashMap<(Ipv4Addr, Ipv4Addr), EdgeInfo>,
}

impl TopologyGraph {
    pub fn new(us: Ipv4Addr, mut self_node: NodeInfo) -> Self {
        self_node.distance = 0;
        self_node.is_direct = true;
        let mut nodes = HashMap::new();
        nodes.insert(us, self_node);
        Self {
            us,
            nodes,
            edges: HashMap::new(),
        }
    }

    pub fn us(&self) -> Ipv4Addr {
        self.us
    }

    /// Change our own address (the client learns it from the handshake).
    /// Carries the self node over and rebuilds distances.
    pub fn rekey_self(&mut self, new_addr: Ipv4Addr) {
        if new_addr == self.us {
            return;
        }
        if let Some(mut node) = self.nodes.remove(&self.us) {
            node.last_seen = now_unix();
            self.nodes.insert(new_addr, node);
        }
        let old = self.us;
        self.us = new_addr;
        let moved: Vec<_> = self
            .edges
            .keys()
            .filter(|(a, b)| *a == old || *b == old)
            .cloned()
            .collect();
        for key in moved {
            if let Some(info) = self.edges.remove(&key) {
                let other = if key.0 == old { key.1 } else { key.0 };
                self.edges.insert(edge_key(new_addr, other), info);
            }
        }
        self.recompute_distances();
    }

    /// Register a directly-connected peer and its edge to us.
    pub fn add_direct_peer(&mut self, addr: Ipv4Addr, mut node: NodeInfo) {
        node.is_direct = true;
        node.last_seen = now_unix();
        self.nodes.insert(addr, node);
        self.edges.insert(
            edge_key(self.us, addr),
            EdgeInfo {
                latency_ms: None,
                bandwidth_bps: None,
                direct: true,
            },
        );
        self.recompute_distances();
    }

    /// Drop the direct edge to a peer. The node itself is retained (marked
    /// indirect, possibly unreachable) until the liveness timeout prunes it.
    pub fn remove_peer(&mut self, addr: Ipv4Addr) {
        self.edges.remove(&edge_key(self.us, addr));
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.is_direct = false;
        }
        self.recompute_distances();
    }

    /// Merge a peer-announced snapshot. Newly seen nodes are added with the
    /// announced attributes; on conflict a directly-observed local node wins,
    /// otherwise the more recently announced version does. Edges referencing
    /// unknown nodes are skipped.
    pub fn merge_announce(&mut self, from: Ipv4Addr, snapshot: &TopologySnapshot) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.last_seen = now_unix();
        }

        for entry in &snapshot.nodes {
            let Ok(addr) = entry.addr.parse::<Ipv4Addr>() else {
                continue;
            };
            if addr == self.us {
                continue;
            }
            match self.nodes.get_mut(&addr) {
                None => {
                    self.nodes.insert(addr, node_from_entry(entry));
                }
                Some(existing) => {
                    if existing.is_direct {
                        // Locally observed attributes win, but a direct node
                        // registered before its identity was known (a client's
                        // hub entry) takes them from the first announcement.
                        if existing.name.is_empty() {
                            existing.name = entry.name.clone();
                            existing.os = entry.os.clone();
                            existing.version = entry.version.clone();
                            existing.public_addr = entry.public_addr.clone();
                        }
                        existing.last_seen = existing.last_seen.max(entry.last_seen);
                    } else if entry.last_seen >= existing.last_seen {
                        *existing = node_from_entry(entry);
                    }
                }
            }
        }

        for entry in &snapshot.edges {
            let (Ok(a), Ok(b)) = (entry.a.parse::<Ipv4Addr>(), entry.b.parse::<Ipv4Addr>())
            else {
                continue;
            };
            if a == b || !self.nodes.contains_key(&a) || !self.nodes.contains_key(&b) {
                continue;
            }
            let key = edge_key(a, b);
            // Never let an announcement overwrite our own direct edges.
            if (key.0 == self.us || key.1 == self.us)
                && self.edges.get(&key).is_some_and(|e| e.direct)
            {
                continue;
            }
            self.edges.insert(
                key,
                EdgeInfo {
                    latency_ms: entry.latency_ms,
                    bandwidth_bps: entry.bandwidth_bps,
                    direct: false,
                },
            );
        }

        self.recompute_distances();
    }

    /// Record a measured round trip to a direct peer.
    pub fn update_latency(&mut self, addr: Ipv4Addr, latency_ms: f64) {
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.latency_ms = Some(latency_ms);
            node.last_seen = now_unix();
        }
        if let Some(edge) = self.edges.get_mut(&edge_key(self.us, addr)) {
            edge.latency_ms = Some(latency_ms);
        }
    }

    /// Drop unreachable nodes whose last contact is older than the liveness
    /// window, along with any edges referencing them.
    pub fn prune(&mut self, liveness_secs: u64) {
        let now = now_unix();
        let us = self.us;
        let stale: Vec<Ipv4Addr> = self
            .nodes
            .iter()
            .filter(|(addr, node)| {
                **addr != us
                    && node.distance < 0
                    && now.saturating_sub(node.last_seen) > liveness_secs
            })
            .map(|(addr, _)| *addr)
            .collect();

        if stale.is_empty() {
            return;
        }
        let stale_set: HashSet<Ipv4Addr> = stale.iter().cloned().collect();
        for addr in &stale {
            self.nodes.remove(addr);
        }
        self.edges
            .retain(|(a, b), _| !stale_set.contains(a) && !stale_set.contains(b));
        self.recompute_distances();
    }

    /// Consistent copy of the graph in wire form.
    pub fn snapshot_for_export(&self) -> TopologySnapshot {
        let nodes = self
            .nodes
            .iter()
            .map(|(addr, node)| NodeEntry {
                addr: addr.to_string(),
                name: node.name.clone(),
                os: node.os.clone(),
                version: node.version.clone(),
                public_addr: node.public_addr.clone(),
                latency_ms: node.latency_ms,
                last_seen: node.last_seen,
                geo: node.geo.clone(),
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|((a, b), info)| EdgeEntry {
                a: a.to_string(),
                b: b.to_string(),
                latency_ms: info.latency_ms,
                bandwidth_bps: info.bandwidth_bps,
                direct: info.direct,
            })
            .collect();
        TopologySnapshot { nodes, edges }
    }

    /// Full local view, for the control RPC's `topology` method.
    pub fn nodes(&self) -> Vec<(Ipv4Addr, NodeInfo)> {
        self.nodes.iter().map(|(a, n)| (*a, n.clone())).collect()
    }

    pub fn direct_peers(&self) -> Vec<(Ipv4Addr, NodeInfo)> {
        self.nodes
            .iter()
            .filter(|(addr, node)| **addr != self.us && node.is_direct)
            .map(|(a, n)| (*a, n.clone()))
            .collect()
    }

    pub fn get(&self, addr: Ipv4Addr) -> Option<&NodeInfo> {
        self.nodes.get(&addr)
    }

    fn recompute_distances(&mut self) {
        let mut adjacency: HashMap<Ipv4Addr, Vec<Ipv4Addr>> = HashMap::new();
        for (a, b) in self.edges.keys() {
            adjacency.entry(*a).or_default().push(*b);
            adjacency.entry(*b).or_default().push(*a);
        }

        let mut dist: HashMap<Ipv4Addr, i32> = HashMap::new();
        dist.insert(self.us, 0);
        let mut queue = VecDeque::new();
        queue.push_back(self.us);
        while let Some(cur) = queue.pop_front() {
            let d = dist[&cur];
            if let Some(neighbors) = adjacency.get(&cur) {
                for n in neighbors {
                    if !dist.contains_key(n) {
                        dist.insert(*n, d + 1);
                        queue.push_back(*n);
                    }
                }
            }
        }

        for (addr, node) in self.nodes.iter_mut() {
            node.distance = dist.get(addr).copied().unwrap_or(-1);
        }
    }
}

fn node_from_entry(entry: &NodeEntry) -> NodeInfo {
    NodeInfo {
        name: entry.name.clone(),
        os: entry.os.clone(),
        version: entry.version.clone(),
        public_addr: entry.public_addr.clone(),
        distance: -1,
        latency_ms: entry.latency_ms,
        last_seen: entry.last_seen,
        geo: entry.geo.clone(),
        is_direct: false,
    }
}

/// Shared handle; only the daemon mutates, the control RPC reads.
pub type SharedTopology = std::sync::Arc<Mutex<TopologyGraph>>;

pub fn shared(graph: TopologyGraph) -> SharedTopology {
    std::sync::Arc::new(Mutex::new(graph))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            os: "linux".to_string(),
            version: "0.3.0".to_string(),
            public_addr: None,
            distance: -1,
            latency_ms: None,
            last_seen: now_unix(),
            geo: None,
            is_direct: false,
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 8, 0, last)
    }

    fn entry(addr: Ipv4Addr, name: &str, last_seen: u64) -> NodeEntry {
        NodeEntry {
            addr: addr.to_string(),
            name: name.to_string(),
            os: "linux".to_string(),
            version: "0.3.0".to_string(),
            public_addr: None,
            latency_ms: None,
            last_seen,
            geo: None,
        }
    }

    #[test]
    fn self_distance_is_zero() {
        let g = TopologyGraph::new(ip(1), node("hub"));
        assert_eq!(g.get(ip(1)).unwrap().distance, 0);
    }

    #[test]
    fn direct_peers_are_one_hop() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));
        g.add_direct_peer(ip(3), node("c2"));
        assert_eq!(g.get(ip(2)).unwrap().distance, 1);
        assert_eq!(g.get(ip(3)).unwrap().distance, 1);
    }

    #[test]
    fn announced_chain_gets_bfs_depths() {
        // Us -> c1 (direct), c1 announces c1--c2, c2--c3.
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));

        let snapshot = TopologySnapshot {
            nodes: vec![
                entry(ip(2), "c1", now_unix()),
                entry(ip(3), "c2", now_unix()),
                entry(ip(4), "c3", now_unix()),
            ],
            edges: vec![
                EdgeEntry {
                    a: ip(2).to_string(),
                    b: ip(3).to_string(),
                    latency_ms: None,
                    bandwidth_bps: None,
                    direct: false,
                },
                EdgeEntry {
                    a: ip(3).to_string(),
                    b: ip(4).to_string(),
                    latency_ms: None,
                    bandwidth_bps: None,
                    direct: false,
                },
            ],
        };
        g.merge_announce(ip(2), &snapshot);

        assert_eq!(g.get(ip(2)).unwrap().distance, 1);
        assert_eq!(g.get(ip(3)).unwrap().distance, 2);
        assert_eq!(g.get(ip(4)).unwrap().distance, 3);
    }

    #[test]
    fn cycles_never_shorten_self_distance() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));
        let snapshot = TopologySnapshot {
            nodes: vec![entry(ip(2), "c1", now_unix())],
            edges: vec![EdgeEntry {
                a: ip(1).to_string(),
                b: ip(2).to_string(),
                latency_ms: None,
                bandwidth_bps: None,
                direct: false,
            }],
        };
        g.merge_announce(ip(2), &snapshot);
        assert_eq!(g.get(ip(1)).unwrap().distance, 0);
        assert_eq!(g.get(ip(2)).unwrap().distance, 1);
    }

    #[test]
    fn disconnected_node_goes_unreachable_then_prunes() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));
        g.remove_peer(ip(2));
        assert_eq!(g.get(ip(2)).unwrap().distance, -1);

        // Still present inside the liveness window.
        g.prune(NODE_LIVENESS_SECS);
        assert!(g.get(ip(2)).is_some());

        // Ages out once stale.
        g.prune(0);
        assert!(g.get(ip(2)).is_none());
    }

    #[test]
    fn direct_observation_beats_announcement() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));

        let snapshot = TopologySnapshot {
            nodes: vec![entry(ip(2), "imposter", now_unix() + 1000)],
            edges: vec![],
        };
        g.merge_announce(ip(2), &snapshot);
        assert_eq!(g.get(ip(2)).unwrap().name, "c1");
    }

    #[test]
    fn newer_announcement_wins_for_indirect_nodes() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));

        let older = TopologySnapshot {
            nodes: vec![entry(ip(3), "old-name", 100)],
            edges: vec![],
        };
        g.merge_announce(ip(2), &older);
        let newer = TopologySnapshot {
            nodes: vec![entry(ip(3), "new-name", 200)],
            edges: vec![],
        };
        g.merge_announce(ip(2), &newer);
        assert_eq!(g.get(ip(3)).unwrap().name, "new-name");

        let stale = TopologySnapshot {
            nodes: vec![entry(ip(3), "stale-name", 150)],
            edges: vec![],
        };
        g.merge_announce(ip(2), &stale);
        assert_eq!(g.get(ip(3)).unwrap().name, "new-name");
    }

    #[test]
    fn edges_to_unknown_nodes_are_skipped() {
        let mut g = TopologyGraph::new(ip(1), node("hub"));
        g.add_direct_peer(ip(2), node("c1"));
        let snapshot = TopologySnapshot {
            nodes: vec![],
            edges: vec![EdgeEntry {
                a: ip(2).to_string(),
                b: ip(99).to_string(),
                latency_ms: None,
                bandwidth_bps: None,
                direct: false,
            }],
        };
        g.merge_announce(ip(2), &snapshot);
        assert_eq!(g.snapshot_for_export().edges.len(), 1);
    }

    #[test]
    fn rekey_self_moves_identity_and_edges() {
        let mut g = TopologyGraph::new(ip(0), node("c1"));
        g.add_direct_peer(ip(1), node("hub"));
        g.rekey_self(ip(7));
        assert_eq!(g.us(), ip(7));
        assert_eq!(g.get(ip(7)).unwrap().distance, 0);
        assert_eq!(g.get(ip(1)).unwrap().distance, 1);
    }
}
