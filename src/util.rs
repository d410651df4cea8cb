use std::net::Ipv4Addr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Echo services tried in order for public-address discovery.
const PUBLIC_ADDR_ENDPOINTS: &[&str] = &[
    "https://checkip.amazonaws.com",
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
];

const PUBLIC_ADDR_TIMEOUT: Duration = Duration::from_secs(4);

pub fn init_tracing() -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(cfg!(not(target_os = "windows")))
        .try_init()?;
    Ok(())
}

/// Current time as Unix seconds.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Ask a few public echo services which IPv4 address this host appears as.
/// The answer is only a handshake hint, so every failure path collapses to
/// `None` and is logged at debug.
pub fn discover_public_ipv4() -> Option<String> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PUBLIC_ADDR_TIMEOUT)
        .build();

    PUBLIC_ADDR_ENDPOINTS.iter().find_map(|endpoint| {
        let response = match agent.get(endpoint).call() {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("public address via {} failed: {}", endpoint, e);
                return None;
            }
        };
        let body = response.into_string().ok()?;
        match body.trim().parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip.to_string()),
            Err(_) => {
                tracing::debug!("{} returned something that is not an IPv4 address", endpoint);
                None
            }
        }
    })
}
