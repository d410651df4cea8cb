//! Destination-based forwarding table.
//!
//! Maps VPN IPv4 → live peer connection. The table and the address allocator
//! share one lock so a frame dispatch observes them consistently. Every live
//! connection with a non-zero assigned address appears exactly once; removal
//! is atomic with connection teardown.

use crate::hub::ip_alloc::IpAllocator;
use crate::network::peer::{PeerCounters, PeerState, PeerStateCell};
use crate::network::queue::FrameQueue;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// The address pool has no free entries left.
#[derive(Debug)]
pub struct PoolExhausted;

impl std::error::Error for PoolExhausted {}

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "address pool exhausted".fmt(f)
    }
}

/// Shared handle to one live peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    /// Unique per connection; teardown only removes the table entry when the
    /// id still matches, so a reconnect cannot be evicted by its predecessor.
    pub id: u64,
    pub name: String,
    pub vpn_ip: Ipv4Addr,
    pub remote_addr: String,
    pub encrypted: bool,
    pub queue: Arc<FrameQueue>,
    pub counters: Arc<PeerCounters>,
    pub state: Arc<PeerStateCell>,
    pub last_activity: Arc<AtomicU64>,
    pub connected_at: u64,
    pub cancel: CancellationToken,
}

impl PeerHandle {
    /// Transition to Closed and wake every task blocked on this connection.
    pub fn shut(&self) {
        self.state.set(PeerState::Closed);
        self.queue.close();
        self.cancel.cancel();
    }
}

struct Inner {
    peers: HashMap<Ipv4Addr, PeerHandle>,
    alloc: IpAllocator,
}

pub struct ForwardingTable {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    /// Data frames dropped because no peer owned the destination.
    pub no_route_drops: AtomicU64,
}

impl ForwardingTable {
    pub fn new(alloc: IpAllocator) -> Self {
        Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                alloc,
            }),
            next_id: AtomicU64::new(1),
            no_route_drops: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pick an address for a dialer. If a live connection already bears this
    /// name, that connection is closed first and its address reused; the
    /// caller receives the displaced handle for logging. The assigned address
    /// is owned by the caller until `register` or `release_addr`.
    pub fn assign(
        &self,
        name: &str,
    ) -> Result<(Ipv4Addr, Option<PeerHandle>), PoolExhausted> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let existing_ip = inner
            .peers
            .values()
            .find(|p| p.name == name)
            .map(|p| p.vpn_ip);
        if let Some(ip) = existing_ip {
            let old = inner.peers.remove(&ip);
            if let Some(ref old) = old {
                old.shut();
            }
            // The address stays marked in-use; ownership passes to the caller.
            return Ok((ip, old));
        }

        match inner.alloc.allocate(name) {
            Some(ip) => Ok((ip, None)),
            None => Err(PoolExhausted),
        }
    }

    /// Install a peer under its assigned address. Returns a displaced handle
    /// in the (should-not-happen) case an entry already held the address.
    pub fn register(&self, handle: PeerHandle) -> Option<PeerHandle> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let displaced = inner.peers.insert(handle.vpn_ip, handle);
        if let Some(ref old) = displaced {
            old.shut();
        }
        displaced
    }

    /// Tear down a registered connection. The entry is only removed (and the
    /// address only freed) when it still belongs to connection `id`.
    pub fn remove(&self, ip: Ipv4Addr, id: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.peers.get(&ip) {
            Some(p) if p.id == id => {
                inner.peers.remove(&ip);
                inner.alloc.release(ip);
                true
            }
            _ => false,
        }
    }

    /// Give back an address that was assigned but never registered (the
    /// handshake reply could not be delivered).
    pub fn release_addr(&self, ip: Ipv4Addr) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.peers.contains_key(&ip) {
            inner.alloc.release(ip);
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<PeerHandle> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .get(&ip)
            .cloned()
    }

    pub fn peers(&self) -> Vec<PeerHandle> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerState;

    fn table() -> ForwardingTable {
        let subnet: ipnet::Ipv4Net = "10.8.0.0/24".parse().unwrap();
        ForwardingTable::new(IpAllocator::new(subnet, Ipv4Addr::new(10, 8, 0, 1)))
    }

    fn handle(t: &ForwardingTable, name: &str, ip: Ipv4Addr) -> PeerHandle {
        PeerHandle {
            id: t.next_id(),
            name: name.to_string(),
            vpn_ip: ip,
            remote_addr: "127.0.0.1:9".to_string(),
            encrypted: true,
            queue: Arc::new(FrameQueue::new(8)),
            counters: Arc::new(PeerCounters::default()),
            state: Arc::new(PeerStateCell::new(PeerState::Active)),
            last_activity: Arc::new(AtomicU64::new(0)),
            connected_at: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn one_peer_per_address() {
        let t = table();
        let (ip1, _) = t.assign("c1").unwrap();
        t.register(handle(&t, "c1", ip1));
        let (ip2, _) = t.assign("c2").unwrap();
        t.register(handle(&t, "c2", ip2));
        assert_ne!(ip1, ip2);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn same_name_displaces_old_connection_and_reuses_address() {
        let t = table();
        let (ip, _) = t.assign("c1").unwrap();
        let old = handle(&t, "c1", ip);
        t.register(old.clone());

        let (ip2, displaced) = t.assign("c1").unwrap();
        assert_eq!(ip, ip2);
        let displaced = displaced.unwrap();
        assert_eq!(displaced.id, old.id);
        assert_eq!(old.state.get(), PeerState::Closed);
        assert!(old.cancel.is_cancelled());

        // New connection registers under the same address.
        t.register(handle(&t, "c1", ip2));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn stale_teardown_cannot_evict_successor() {
        let t = table();
        let (ip, _) = t.assign("c1").unwrap();
        let old = handle(&t, "c1", ip);
        t.register(old.clone());

        let (_, _) = t.assign("c1").unwrap();
        let new = handle(&t, "c1", ip);
        t.register(new.clone());

        // The displaced session's cleanup must not remove the new entry.
        assert!(!t.remove(ip, old.id));
        assert!(t.lookup(ip).is_some());
        assert!(t.remove(ip, new.id));
        assert!(t.lookup(ip).is_none());
    }

    #[test]
    fn release_addr_only_when_unregistered() {
        let t = table();
        let (ip, _) = t.assign("c1").unwrap();
        // Handshake reply failed; address goes back to the pool.
        t.release_addr(ip);
        let (ip2, _) = t.assign("c2").unwrap();
        assert_eq!(ip, ip2);
    }
}
