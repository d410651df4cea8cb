//! VPN address pool.
//!
//! A finite pool over the configured subnet with the hub's own address
//! reserved. Every entry is either free or owned by exactly one connection.
//! Reassignment is name-sticky: a reconnecting node gets its previous address
//! back when it is still free, otherwise the lowest free address. The
//! preference map is seeded from the intent store so affinity survives hub
//! restarts.

use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub struct IpAllocator {
    pool: Vec<Ipv4Addr>,
    in_use: HashMap<Ipv4Addr, String>,
    preferred: HashMap<String, Ipv4Addr>,
}

impl IpAllocator {
    pub fn new(subnet: Ipv4Net, hub_addr: Ipv4Addr) -> Self {
        let pool: Vec<Ipv4Addr> = subnet.hosts().filter(|a| *a != hub_addr).collect();
        Self {
            pool,
            in_use: HashMap::new(),
            preferred: HashMap::new(),
        }
    }

    /// Remember a node's historical address without marking it in use.
    pub fn seed_preference(&mut self, name: &str, addr: Ipv4Addr) {
        if self.pool.contains(&addr) {
            self.preferred.insert(name.to_string(), addr);
        }
    }

    /// Hand out an address for `name`, or `None` when the pool is exhausted.
    pub fn allocate(&mut self, name: &str) -> Option<Ipv4Addr> {
        let addr = match self.preferred.get(name) {
            Some(prior) if !self.in_use.contains_key(prior) => *prior,
            _ => *self
                .pool
                .iter()
                .find(|a| !self.in_use.contains_key(a))?,
        };
        self.in_use.insert(addr, name.to_string());
        self.preferred.insert(name.to_string(), addr);
        Some(addr)
    }

    /// Return an address to the pool. Name affinity is kept.
    pub fn release(&mut self, addr: Ipv4Addr) {
        self.in_use.remove(&addr);
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc24() -> IpAllocator {
        let subnet: Ipv4Net = "10.8.0.0/24".parse().unwrap();
        IpAllocator::new(subnet, Ipv4Addr::new(10, 8, 0, 1))
    }

    #[test]
    fn lowest_free_first() {
        let mut alloc = alloc24();
        assert_eq!(alloc.allocate("c1"), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(alloc.allocate("c2"), Some(Ipv4Addr::new(10, 8, 0, 3)));
    }

    #[test]
    fn name_sticky_reassignment() {
        let mut alloc = alloc24();
        let first = alloc.allocate("c1").unwrap();
        let _ = alloc.allocate("c2").unwrap();
        alloc.release(first);
        // c1 returns and its old address is still free.
        assert_eq!(alloc.allocate("c1"), Some(first));
    }

    #[test]
    fn stolen_address_falls_back_to_lowest_free() {
        let mut alloc = alloc24();
        let first = alloc.allocate("c1").unwrap();
        alloc.release(first);
        // Someone else took .2 while c1 was away.
        assert_eq!(alloc.allocate("c2"), Some(first));
        assert_eq!(alloc.allocate("c1"), Some(Ipv4Addr::new(10, 8, 0, 3)));
    }

    #[test]
    fn seeded_preference_survives() {
        let mut alloc = alloc24();
        alloc.seed_preference("c1", Ipv4Addr::new(10, 8, 0, 40));
        assert_eq!(alloc.allocate("c1"), Some(Ipv4Addr::new(10, 8, 0, 40)));
    }

    #[test]
    fn tiny_subnet_exhausts() {
        // /30 leaves exactly one usable client address beside the hub.
        let subnet: Ipv4Net = "10.8.0.0/30".parse().unwrap();
        let mut alloc = IpAllocator::new(subnet, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(alloc.pool_size(), 1);
        assert_eq!(alloc.allocate("c1"), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(alloc.allocate("c2"), None);
        alloc.release(Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(alloc.allocate("c2"), Some(Ipv4Addr::new(10, 8, 0, 2)));
    }
}
