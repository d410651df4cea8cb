use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default window after startup during which re-appearing routed clients
/// receive a RECONNECT_INVITE.
pub const DEFAULT_INVITE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Public listen address, e.g. "0.0.0.0:7000".
    pub listen_addr: String,
    /// VPN subnet the allocator hands addresses from.
    pub subnet: Ipv4Net,
    /// The hub's own VPN address, reserved out of the pool.
    pub vpn_addr: Ipv4Addr,
    pub mtu: u16,
    pub invite_window: Duration,
}

impl HubConfig {
    pub fn netmask(&self) -> Ipv4Addr {
        self.subnet.netmask()
    }
}
