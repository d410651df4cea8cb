use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub address, e.g. "203.0.113.9:7000".
    pub server_addr: String,
    pub name: String,
    /// Whether to ask for route-all at connect time.
    pub route_all: bool,
    /// False selects the plaintext development tunnel (`enc_flag = 0`).
    pub encrypted: bool,
    pub mtu: u16,
    /// Netmask written to the TUN device, derived from the subnet.
    pub netmask: Ipv4Addr,
    /// The hub's VPN address: routing gateway and latency-probe target.
    pub hub_vpn_addr: Ipv4Addr,
    /// Dial automatically at startup (false after an explicit disconnect).
    pub auto_connect: bool,
}
