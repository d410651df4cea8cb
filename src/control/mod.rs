//! Control RPC server.
//!
//! A line-delimited JSON request/response surface bound to a loopback address
//! (and additionally to the VPN address when `--listen-vpn` is set, so peers
//! can query each other). One request object per line in, one
//! `{ok, data?, error?}` object per line out. The server does not
//! authenticate; it relies on the binding address being private.

pub mod timeexpr;

use crate::client::client::{ClientCommand, ClientStatus};
use crate::hub::forwarding::ForwardingTable;
use crate::identity::NodeIdentity;
use crate::intent::IntentStore;
use crate::network::peer::CounterSnapshot;
use crate::observe::SqliteSink;
use crate::topology::SharedTopology;
use crate::util::now_unix;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const DEFAULT_LOG_LOOKBACK_SECS: i64 = 3600;
const DEFAULT_QUERY_LIMIT: usize = 100;
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(20);
const DISCONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Client,
}

/// Everything the RPC (and the HTTP status surface) can answer from. The
/// daemon populates the fields for its role; the rest stay `None`.
pub struct ControlState {
    pub identity: NodeIdentity,
    pub role: Role,
    pub started_at: u64,
    pub topology: SharedTopology,
    pub store: Option<Arc<SqliteSink>>,
    // Hub side.
    pub intent: Option<Arc<IntentStore>>,
    pub table: Option<Arc<ForwardingTable>>,
    pub hub_vpn_addr: Option<Ipv4Addr>,
    pub listen_addr: Option<String>,
    // Client side.
    pub client_status: Option<Arc<ClientStatus>>,
    pub client_ctl: Option<mpsc::Sender<ClientCommand>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub role: Role,
    pub version: String,
    pub os: String,
    pub uptime_secs: u64,
    pub vpn_addr: Option<String>,
    pub peer_count: usize,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub frames_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<crate::client::client::ConnInfo>,
}

impl ControlState {
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot {
            name: self.identity.name.clone(),
            role: self.role,
            version: self.identity.version.clone(),
            os: self.identity.os.clone(),
            uptime_secs: now_unix().saturating_sub(self.started_at),
            vpn_addr: self.hub_vpn_addr.map(|a| a.to_string()),
            peer_count: 0,
            bytes_tx: 0,
            bytes_rx: 0,
            frames_dropped: 0,
            listen_addr: self.listen_addr.clone(),
            connection: None,
        };

        if let Some(table) = &self.table {
            let peers = table.peers();
            snapshot.peer_count = peers.len();
            for peer in &peers {
                let c = peer.counters.snapshot();
                snapshot.bytes_tx += c.bytes_tx;
                snapshot.bytes_rx += c.bytes_rx;
                snapshot.frames_dropped += peer.queue.dropped();
            }
            snapshot.frames_dropped += table.no_route_drops.load(Ordering::Relaxed);
        }

        if let Some(status) = &self.client_status {
            let info = status.snapshot();
            let c = status.counters.snapshot();
            snapshot.vpn_addr = info.vpn_addr.map(|a| a.to_string());
            snapshot.peer_count = {
                let graph = self.topology.lock().unwrap_or_else(|e| e.into_inner());
                graph.direct_peers().len()
            };
            snapshot.bytes_tx = c.bytes_tx;
            snapshot.bytes_rx = c.bytes_rx;
            snapshot.connection = Some(info);
        }

        snapshot
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

pub async fn serve(
    addr: String,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("control rpc listening on {}", addr);

    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (socket, peer) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("control accept failed: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(socket, state, shutdown).await {
                        tracing::debug!("control connection {} ended: {}", peer, e);
                    }
                });
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn handle_conn(
    socket: tokio::net::TcpStream,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let (rd, mut wr) = socket.into_split();
    let mut lines = BufReader::new(rd).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<RpcRequest>(&line) {
                    Ok(request) => dispatch(&state, request).await,
                    Err(e) => RpcResponse::failure(format!("bad request: {}", e)),
                };
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                wr.write_all(&out).await?;
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn dispatch(state: &Arc<ControlState>, request: RpcRequest) -> RpcResponse {
    let result = match request.method.as_str() {
        "status" => Ok(json!(state.status_snapshot())),
        "peers" => peers(state),
        "logs" => logs(state, &request.params),
        "stats" => stats(state, &request.params),
        "topology" => topology(state),
        "connect" => connect(state, &request.params).await,
        "disconnect" => disconnect(state, &request.params).await,
        "connection-status" => connection_status(state),
        "handshake" => handshake_info(state),
        other => Err(format!("unknown method: {}", other).into()),
    };
    match result {
        Ok(data) => RpcResponse::success(data),
        Err(e) => RpcResponse::failure(e.to_string()),
    }
}

fn peers(state: &Arc<ControlState>) -> crate::Result<serde_json::Value> {
    if let Some(table) = &state.table {
        #[derive(Serialize)]
        struct PeerRow {
            name: String,
            vpn_ip: String,
            remote_addr: String,
            state: crate::network::peer::PeerState,
            encrypted: bool,
            connected_at: u64,
            last_activity: u64,
            queue_dropped: u64,
            #[serde(flatten)]
            counters: CounterSnapshot,
        }
        let rows: Vec<PeerRow> = table
            .peers()
            .into_iter()
            .map(|p| PeerRow {
                name: p.name.clone(),
                vpn_ip: p.vpn_ip.to_string(),
                remote_addr: p.remote_addr.clone(),
                state: p.state.get(),
                encrypted: p.encrypted,
                connected_at: p.connected_at,
                last_activity: p.last_activity.load(Ordering::Relaxed),
                queue_dropped: p.queue.dropped(),
                counters: p.counters.snapshot(),
            })
            .collect();
        return Ok(json!(rows));
    }

    // Client side: direct peers from the topology view.
    let graph = state.topology.lock().unwrap_or_else(|e| e.into_inner());
    let rows: Vec<serde_json::Value> = graph
        .direct_peers()
        .into_iter()
        .map(|(addr, node)| {
            let mut v = json!(node);
            v["addr"] = json!(addr.to_string());
            v
        })
        .collect();
    Ok(json!(rows))
}

fn time_range(params: &serde_json::Value) -> crate::Result<(i64, i64)> {
    let now = now_unix() as i64;
    let since = match params.get("since").and_then(|v| v.as_str()) {
        Some(expr) => timeexpr::parse(expr, now)?,
        None => now - DEFAULT_LOG_LOOKBACK_SECS,
    };
    let until = match params.get("until").and_then(|v| v.as_str()) {
        Some(expr) => timeexpr::parse(expr, now)?,
        None => now,
    };
    Ok((since, until))
}

fn logs(state: &Arc<ControlState>, params: &serde_json::Value) -> crate::Result<serde_json::Value> {
    let store = state.store.as_ref().ok_or("logs: store not available")?;
    let (since, until) = time_range(params)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_QUERY_LIMIT as u64) as usize;
    Ok(json!(store.query_logs(since, until, limit)?))
}

fn stats(
    state: &Arc<ControlState>,
    params: &serde_json::Value,
) -> crate::Result<serde_json::Value> {
    let (since, until) = time_range(params)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_QUERY_LIMIT as u64) as usize;
    let samples = match &state.store {
        Some(store) => store.query_metrics(since, until, limit)?,
        None => Vec::new(),
    };
    Ok(json!({
        "status": state.status_snapshot(),
        "samples": samples,
    }))
}

fn topology(state: &Arc<ControlState>) -> crate::Result<serde_json::Value> {
    let graph = state.topology.lock().unwrap_or_else(|e| e.into_inner());
    let nodes: Vec<serde_json::Value> = graph
        .nodes()
        .into_iter()
        .map(|(addr, node)| {
            let mut v = json!(node);
            v["addr"] = json!(addr.to_string());
            v
        })
        .collect();
    let snapshot = graph.snapshot_for_export();
    Ok(json!({
        "us": graph.us().to_string(),
        "nodes": nodes,
        "edges": snapshot.edges,
    }))
}

async fn connect(
    state: &Arc<ControlState>,
    params: &serde_json::Value,
) -> crate::Result<serde_json::Value> {
    let ctl = state
        .client_ctl
        .as_ref()
        .ok_or("connect: this node is not a client")?;
    let route_all = params.get("route_all").and_then(|v| v.as_bool());
    let (tx, rx) = oneshot::channel();
    ctl.send(ClientCommand::Connect {
        route_all,
        reply: tx,
    })
    .await
    .map_err(|_| "client daemon not running")?;

    match tokio::time::timeout(CONNECT_REPLY_TIMEOUT, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("client daemon dropped the request".into()),
        // Still dialing; the attempt continues in the background.
        Err(_) => Ok(json!({"status": "connecting"})),
    }
}

async fn disconnect(
    state: &Arc<ControlState>,
    params: &serde_json::Value,
) -> crate::Result<serde_json::Value> {
    let ctl = state
        .client_ctl
        .as_ref()
        .ok_or("disconnect: this node is not a client")?;
    let reason = params
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("user request")
        .to_string();
    let (tx, rx) = oneshot::channel();
    ctl.send(ClientCommand::Disconnect { reason, reply: tx })
        .await
        .map_err(|_| "client daemon not running")?;

    match tokio::time::timeout(DISCONNECT_REPLY_TIMEOUT, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("client daemon dropped the request".into()),
        Err(_) => Ok(json!({"status": "disconnecting"})),
    }
}

fn connection_status(state: &Arc<ControlState>) -> crate::Result<serde_json::Value> {
    let status = state
        .client_status
        .as_ref()
        .ok_or("connection-status: this node is not a client")?;
    Ok(json!(status.snapshot()))
}

fn handshake_info(state: &Arc<ControlState>) -> crate::Result<serde_json::Value> {
    let status = state
        .client_status
        .as_ref()
        .ok_or("handshake: this node is not a client")?;
    let info = status.snapshot();
    Ok(json!({
        "server": info.server,
        "assigned_ip": info.vpn_addr.map(|a| a.to_string()),
        "encrypted": info.encrypted,
        "state": info.state,
    }))
}
