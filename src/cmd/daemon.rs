//! meshtund: hub and client in one binary.
//!
//! Exit codes: 0 after a clean shutdown on SIGTERM/SIGINT, 1 on startup
//! failure, 2 on unrecoverable I/O during steady state.

use anyhow::{bail, Context};
use clap::Parser;
use meshtun::client::client::{ClientStatus, VpnClient};
use meshtun::client::config::ClientConfig;
use meshtun::control::{self, ControlState, Role};
use meshtun::crypto::{self, SharedBlock};
use meshtun::http;
use meshtun::hub::config::{HubConfig, DEFAULT_INVITE_WINDOW};
use meshtun::hub::server::Hub;
use meshtun::identity::NodeIdentity;
use meshtun::intent::{self, IntentStore};
use meshtun::netdev::device::{DeviceConfig, DeviceHandler, DEFAULT_MTU};
use meshtun::netdev::route_all::RouteController;
use meshtun::observe::{self, event, Sink, SqliteSink};
use meshtun::topology::{self, NodeInfo, TopologyGraph};
use meshtun::util;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_LISTEN: &str = "0.0.0.0:7000";
const DEFAULT_LISTEN_CONTROL: &str = "127.0.0.1:7787";
const DEFAULT_SUBNET: &str = "10.8.0.0/24";

/// Peer-to-peer mesh VPN daemon
#[derive(Parser, Debug)]
#[command(name = "meshtund", version, about, long_about = None)]
struct Args {
    /// Run as the hub: accept tunnels and relay between clients
    #[arg(long)]
    server: bool,

    /// Dial a hub at HOST:PORT and run as a client
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "server")]
    connect: Option<String>,

    /// Node name ("hub" by default in server mode; required for clients)
    #[arg(long)]
    name: Option<String>,

    /// Hub bind address (server mode)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// The hub's VPN address (defaults to the first host of --subnet)
    #[arg(long, value_name = "IP")]
    vpn_addr: Option<Ipv4Addr>,

    /// Additionally bind the control RPC on the VPN address
    #[arg(long)]
    listen_vpn: bool,

    /// Control RPC bind address
    #[arg(long, value_name = "ADDR")]
    listen_control: Option<String>,

    /// HTTP status bind address (disabled when absent)
    #[arg(long, value_name = "ADDR")]
    listen_ui: Option<String>,

    /// Redirect all host traffic through the tunnel (client mode)
    #[arg(long)]
    route_all: bool,

    /// TUN device MTU
    #[arg(long)]
    mtu: Option<u16>,

    /// VPN subnet in CIDR form
    #[arg(long, value_name = "CIDR")]
    subnet: Option<String>,

    /// State directory (intent store, route snapshot, observability store)
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Optional TOML config file; flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Base64-encoded 32-byte shared key
    #[arg(long, value_name = "PATH")]
    key_file: Option<PathBuf>,

    /// Run tunnels in plaintext. Development only; traffic is not protected
    #[arg(long)]
    plaintext: bool,

    /// Reconnect-invite window after hub startup, in seconds
    #[arg(long)]
    invite_window_secs: Option<u64>,

    /// Skip public address discovery at startup
    #[arg(long)]
    no_public_addr: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    name: Option<String>,
    data_dir: Option<PathBuf>,
    key_file: Option<PathBuf>,
    #[serde(default)]
    hub: HubSection,
    #[serde(default)]
    client: ClientSection,
}

#[derive(Debug, Default, Deserialize)]
struct HubSection {
    listen: Option<String>,
    subnet: Option<String>,
    vpn_addr: Option<Ipv4Addr>,
    invite_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    server: Option<String>,
    route_all: Option<bool>,
    mtu: Option<u16>,
}

fn load_config(path: &PathBuf) -> anyhow::Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: FileConfig =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    if let Err(e) = util::init_tracing() {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("startup failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let file = match &args.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };

    let server_addr = args.connect.clone().or(file.client.server.clone());
    if !args.server && server_addr.is_none() {
        bail!("choose a role: --server or --connect HOST:PORT");
    }

    let subnet_str = args
        .subnet
        .clone()
        .or(file.hub.subnet.clone())
        .unwrap_or_else(|| DEFAULT_SUBNET.to_string());
    let subnet: Ipv4Net = subnet_str
        .parse()
        .with_context(|| format!("bad --subnet {}", subnet_str))?;
    let hub_vpn = args
        .vpn_addr
        .or(file.hub.vpn_addr)
        .or_else(|| subnet.hosts().next())
        .context("subnet has no usable addresses")?;

    let data_dir = args
        .data_dir
        .clone()
        .or(file.data_dir.clone())
        .or_else(|| dirs::data_local_dir().map(|d| d.join("meshtun")))
        .context("no data directory available; pass --data-dir")?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let key_file = args.key_file.clone().or(file.key_file.clone());
    let encrypted = !args.plaintext;
    let block: SharedBlock = match (&key_file, args.plaintext) {
        (Some(path), _) => {
            let key = crypto::load_key(path).map_err(|e| anyhow::anyhow!("{}", e))?;
            crypto::aes_block(&key)
        }
        (None, true) => {
            tracing::warn!("running WITHOUT encryption; use --key-file in production");
            crypto::plain_block()
        }
        (None, false) => bail!("--key-file is required (or --plaintext for development)"),
    };

    let name = match (args.name.clone().or(file.name.clone()), args.server) {
        (Some(name), _) => name,
        (None, true) => "hub".to_string(),
        (None, false) => bail!("--name is required in client mode"),
    };

    let mtu = args.mtu.or(file.client.mtu).unwrap_or(DEFAULT_MTU);
    let listen_control = args
        .listen_control
        .clone()
        .unwrap_or_else(|| DEFAULT_LISTEN_CONTROL.to_string());
    let control_port = listen_control
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .context("bad --listen-control address")?;

    let public_addr = if args.no_public_addr {
        None
    } else {
        tokio::task::spawn_blocking(util::discover_public_ipv4)
            .await
            .unwrap_or(None)
    };
    let identity = NodeIdentity::new(name, public_addr);
    tracing::info!(
        "node {} ({} {}) version {}",
        identity.name,
        identity.os,
        identity.arch,
        identity.version
    );

    let store = SqliteSink::open(&data_dir.join(observe::STORE_FILE))
        .map_err(|e| anyhow::anyhow!("open observability store: {}", e))?;
    let sink: Arc<dyn Sink> = store.clone();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if args.server {
        run_hub(
            args, file, subnet, hub_vpn, mtu, data_dir, block, identity, store, sink,
            listen_control, control_port, shutdown,
        )
        .await
    } else {
        run_client(
            args,
            file,
            server_addr.expect("checked above"),
            subnet,
            hub_vpn,
            mtu,
            encrypted,
            data_dir,
            block,
            identity,
            store,
            sink,
            listen_control,
            control_port,
            shutdown,
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_hub(
    args: Args,
    file: FileConfig,
    subnet: Ipv4Net,
    hub_vpn: Ipv4Addr,
    mtu: u16,
    data_dir: PathBuf,
    block: SharedBlock,
    identity: NodeIdentity,
    store: Arc<SqliteSink>,
    sink: Arc<dyn Sink>,
    listen_control: String,
    control_port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<i32> {
    let listen_addr = args
        .listen
        .clone()
        .or(file.hub.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let invite_window = args
        .invite_window_secs
        .or(file.hub.invite_window_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_INVITE_WINDOW);

    let intent_store = Arc::new(
        IntentStore::open(&data_dir.join(intent::STORE_FILE))
            .map_err(|e| anyhow::anyhow!("open intent store: {}", e))?,
    );

    let hub_cfg = HubConfig {
        listen_addr: listen_addr.clone(),
        subnet,
        vpn_addr: hub_vpn,
        mtu,
        invite_window,
    };
    let hub = Hub::new(
        hub_cfg,
        block,
        intent_store.clone(),
        sink.clone(),
        &identity,
        shutdown.clone(),
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    let control_state = Arc::new(ControlState {
        identity,
        role: Role::Hub,
        started_at: util::now_unix(),
        topology: hub.topology(),
        store: Some(store),
        intent: Some(intent_store),
        table: Some(hub.table()),
        hub_vpn_addr: Some(hub_vpn),
        listen_addr: Some(listen_addr),
        client_status: None,
        client_ctl: None,
    });
    spawn_control(listen_control, control_state.clone(), shutdown.clone());
    if args.listen_vpn {
        spawn_control(
            format!("{}:{}", hub_vpn, control_port),
            control_state.clone(),
            shutdown.clone(),
        );
    }
    if let Some(ui_addr) = args.listen_ui.clone() {
        spawn_ui(ui_addr, control_state.clone(), shutdown.clone());
    }

    // Startup phase: bind and device creation failures exit with code 1.
    let acceptor = hub.bind().await.map_err(|e| anyhow::anyhow!("{}", e))?;
    let device = DeviceHandler::open(DeviceConfig {
        address: hub_vpn,
        netmask: subnet.netmask(),
        mtu,
    })
    .await
    .map_err(|e| anyhow::anyhow!("open tun device: {}", e))?;

    sink.log(event("info", "daemon", "hub started"));
    match hub.serve(acceptor, device).await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            Ok(0)
        }
        Err(e) => {
            tracing::error!("unrecoverable error: {}", e);
            Ok(2)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    args: Args,
    file: FileConfig,
    server_addr: String,
    subnet: Ipv4Net,
    hub_vpn: Ipv4Addr,
    mtu: u16,
    encrypted: bool,
    data_dir: PathBuf,
    block: SharedBlock,
    identity: NodeIdentity,
    store: Arc<SqliteSink>,
    sink: Arc<dyn Sink>,
    listen_control: String,
    control_port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<i32> {
    let route_all = args.route_all || file.client.route_all.unwrap_or(false);

    let status = ClientStatus::new(server_addr.clone(), encrypted);
    let (ctl_tx, ctl_rx) = mpsc::channel(8);
    let topology = topology::shared(TopologyGraph::new(
        Ipv4Addr::UNSPECIFIED,
        NodeInfo {
            name: identity.name.clone(),
            os: identity.os.clone(),
            version: identity.version.clone(),
            public_addr: identity.public_addr.clone(),
            distance: 0,
            latency_ms: None,
            last_seen: util::now_unix(),
            geo: None,
            is_direct: true,
        },
    ));

    let client_cfg = ClientConfig {
        server_addr: server_addr.clone(),
        name: identity.name.clone(),
        route_all,
        encrypted,
        mtu,
        netmask: subnet.netmask(),
        hub_vpn_addr: hub_vpn,
        auto_connect: true,
    };
    let client = VpnClient::new(
        client_cfg,
        block,
        identity.clone(),
        topology.clone(),
        sink.clone(),
        status.clone(),
        RouteController::new(&data_dir),
        ctl_rx,
        shutdown.clone(),
    );

    let control_state = Arc::new(ControlState {
        identity,
        role: Role::Client,
        started_at: util::now_unix(),
        topology,
        store: Some(store),
        intent: None,
        table: None,
        hub_vpn_addr: None,
        listen_addr: None,
        client_status: Some(status.clone()),
        client_ctl: Some(ctl_tx),
    });
    spawn_control(listen_control, control_state.clone(), shutdown.clone());
    if args.listen_vpn {
        spawn_vpn_control(status, control_state.clone(), control_port, shutdown.clone());
    }
    if let Some(ui_addr) = args.listen_ui.clone() {
        spawn_ui(ui_addr, control_state.clone(), shutdown.clone());
    }

    sink.log(event("info", "daemon", "client started"));
    match client.run().await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            Ok(0)
        }
        Err(e) => {
            tracing::error!("unrecoverable error: {}", e);
            Ok(2)
        }
    }
}

fn spawn_control(addr: String, state: Arc<ControlState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = control::serve(addr.clone(), state, shutdown).await {
            tracing::error!("control rpc on {} failed: {}", addr, e);
        }
    });
}

fn spawn_ui(addr: String, state: Arc<ControlState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = http::serve(addr.clone(), state, shutdown).await {
            tracing::error!("http status server on {} failed: {}", addr, e);
        }
    });
}

/// A client only learns its VPN address from the handshake; bind the extra
/// control listener once the address exists.
fn spawn_vpn_control(
    status: Arc<ClientStatus>,
    state: Arc<ControlState>,
    control_port: u16,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if let Some(addr) = status.snapshot().vpn_addr {
                let bind = format!("{}:{}", addr, control_port);
                match control::serve(bind.clone(), state.clone(), shutdown.clone()).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!("control rpc on {} failed: {}, retrying", bind, e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("cannot install SIGTERM handler: {}", e);
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("cannot install SIGINT handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received, draining");
        shutdown.cancel();
    });
}
