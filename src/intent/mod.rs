//! Durable connection-intent store.
//!
//! The hub records what each client most recently *wanted* (connected with
//! routing, connected without, or explicitly disconnected), keyed by VPN
//! address. Records are created on first handshake, updated on every state
//! change, and never deleted, so intent survives hub restarts. Writes are
//! transactional and crash-consistent: a transition committed here is visible
//! after an immediate kill. `clients_for_invite` is the single source of
//! truth consulted on startup for RECONNECT_INVITE replay.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const STORE_FILE: &str = "intent.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    ConnectedRouting,
    ConnectedNoRouting,
    DisconnectedIntentional,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::ConnectedRouting => "connected_routing",
            ClientState::ConnectedNoRouting => "connected_no_routing",
            ClientState::DisconnectedIntentional => "disconnected_intentional",
        }
    }

    fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "connected_routing" => Ok(ClientState::ConnectedRouting),
            "connected_no_routing" => Ok(ClientState::ConnectedNoRouting),
            "disconnected_intentional" => Ok(ClientState::DisconnectedIntentional),
            other => Err(format!("unknown client state: {}", other).into()),
        }
    }
}

impl Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStateRecord {
    pub vpn_address: Ipv4Addr,
    pub node_name: String,
    pub state: ClientState,
    pub route_all: bool,
    pub connected_at: Option<String>,
    pub disconnected_at: Option<String>,
    pub disconnect_reason: Option<String>,
    pub last_updated: String,
}

pub struct IntentStore {
    conn: Mutex<Connection>,
}

impl IntentStore {
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS client_states (
                vpn_address       TEXT PRIMARY KEY,
                node_name         TEXT NOT NULL,
                state             TEXT NOT NULL,
                route_all         INTEGER NOT NULL,
                connected_at      TEXT,
                disconnected_at   TEXT,
                disconnect_reason TEXT,
                last_updated      TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a completed handshake. Sets `connected_routing` or
    /// `connected_no_routing` according to the client's announced flag.
    pub fn set_connected(&self, addr: Ipv4Addr, name: &str, route_all: bool) -> crate::Result<()> {
        let state = if route_all {
            ClientState::ConnectedRouting
        } else {
            ClientState::ConnectedNoRouting
        };
        let now = now_rfc3339()?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO client_states
                 (vpn_address, node_name, state, route_all, connected_at,
                  disconnected_at, disconnect_reason, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?5)
             ON CONFLICT(vpn_address) DO UPDATE SET
                 node_name = ?2, state = ?3, route_all = ?4,
                 connected_at = ?5, disconnected_at = NULL,
                 disconnect_reason = NULL, last_updated = ?5",
            params![addr.to_string(), name, state.as_str(), route_all as i64, now],
        )?;
        Ok(())
    }

    /// Runtime route-all toggle for an already-connected client.
    pub fn set_route_all(&self, addr: Ipv4Addr, route_all: bool) -> crate::Result<()> {
        let state = if route_all {
            ClientState::ConnectedRouting
        } else {
            ClientState::ConnectedNoRouting
        };
        let now = now_rfc3339()?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE client_states
                 SET state = ?2, route_all = ?3, last_updated = ?4
             WHERE vpn_address = ?1",
            params![addr.to_string(), state.as_str(), route_all as i64, now],
        )?;
        Ok(())
    }

    /// The user explicitly disconnected this client. Sticky across restarts:
    /// such clients are never invited back.
    pub fn set_disconnected_intentional(&self, addr: Ipv4Addr, reason: &str) -> crate::Result<()> {
        let now = now_rfc3339()?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE client_states
                 SET state = ?2, disconnected_at = ?3,
                     disconnect_reason = ?4, last_updated = ?3
             WHERE vpn_address = ?1",
            params![
                addr.to_string(),
                ClientState::DisconnectedIntentional.as_str(),
                now,
                reason
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, addr: Ipv4Addr) -> crate::Result<Option<ClientStateRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let record = conn
            .query_row(
                "SELECT vpn_address, node_name, state, route_all, connected_at,
                        disconnected_at, disconnect_reason, last_updated
                 FROM client_states WHERE vpn_address = ?1",
                params![addr.to_string()],
                row_to_record,
            )
            .optional()?;
        record.map(decode_record).transpose()
    }

    /// Records the hub replays RECONNECT_INVITE for after a restart: exactly
    /// those whose last recorded state is `connected_routing`.
    pub fn clients_for_invite(&self) -> crate::Result<Vec<ClientStateRecord>> {
        self.select_where("WHERE state = 'connected_routing'")
    }

    /// Every record, used to seed the IP allocator's name→address affinity.
    pub fn all(&self) -> crate::Result<Vec<ClientStateRecord>> {
        self.select_where("")
    }

    fn select_where(&self, clause: &str) -> crate::Result<Vec<ClientStateRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT vpn_address, node_name, state, route_all, connected_at,
                    disconnected_at, disconnect_reason, last_updated
             FROM client_states {} ORDER BY vpn_address",
            clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(decode_record(row?)?);
        }
        Ok(records)
    }
}

struct RawRecord {
    vpn_address: String,
    node_name: String,
    state: String,
    route_all: i64,
    connected_at: Option<String>,
    disconnected_at: Option<String>,
    disconnect_reason: Option<String>,
    last_updated: String,
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        vpn_address: row.get(0)?,
        node_name: row.get(1)?,
        state: row.get(2)?,
        route_all: row.get(3)?,
        connected_at: row.get(4)?,
        disconnected_at: row.get(5)?,
        disconnect_reason: row.get(6)?,
        last_updated: row.get(7)?,
    })
}

fn decode_record(raw: RawRecord) -> crate::Result<ClientStateRecord> {
    Ok(ClientStateRecord {
        vpn_address: raw
            .vpn_address
            .parse()
            .map_err(|_| format!("bad vpn address in store: {}", raw.vpn_address))?,
        node_name: raw.node_name,
        state: ClientState::parse(&raw.state)?,
        route_all: raw.route_all != 0,
        connected_at: raw.connected_at,
        disconnected_at: raw.disconnected_at,
        disconnect_reason: raw.disconnect_reason,
        last_updated: raw.last_updated,
    })
}

fn now_rfc3339() -> crate::Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}
