//! Observability sink.
//!
//! The daemon and its subsystems write structured log events and metric
//! samples through an explicitly-passed [`Sink`] capability; there is no
//! process-wide sink. The store behind the SQLite sink is an external
//! collaborator: the core only depends on appending to it, plus the two
//! bounded time-range queries the control RPC's `logs`/`stats` methods need.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const STORE_FILE: &str = "observe.db";

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    /// Unix seconds.
    pub ts: i64,
    pub level: String,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    /// Unix seconds.
    pub ts: i64,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
}

/// Where the core writes its structured records. Writes are fire-and-forget:
/// a sink failure is logged and never propagated into the data plane.
pub trait Sink: Send + Sync {
    fn log(&self, event: LogEvent);
    fn metric(&self, sample: MetricSample);
}

/// Build a log event stamped now.
pub fn event(level: &str, source: &str, message: impl Into<String>) -> LogEvent {
    LogEvent {
        ts: crate::util::now_unix() as i64,
        level: level.to_string(),
        source: source.to_string(),
        message: message.into(),
    }
}

/// Build a metric sample stamped now.
pub fn sample(name: &str, value: f64, labels: Option<String>) -> MetricSample {
    MetricSample {
        ts: crate::util::now_unix() as i64,
        name: name.to_string(),
        value,
        labels,
    }
}

/// Discards everything; used by tests.
pub struct NullSink;

impl Sink for NullSink {
    fn log(&self, _event: LogEvent) {}
    fn metric(&self, _sample: MetricSample) {}
}

/// Appends to the SQLite-backed store under the data dir.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> crate::Result<Arc<Self>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS logs (
                ts      INTEGER NOT NULL,
                level   TEXT NOT NULL,
                source  TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS logs_ts ON logs (ts);
            CREATE TABLE IF NOT EXISTS metrics (
                ts     INTEGER NOT NULL,
                name   TEXT NOT NULL,
                value  REAL NOT NULL,
                labels TEXT
            );
            CREATE INDEX IF NOT EXISTS metrics_ts ON metrics (ts);",
        )?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn query_logs(
        &self,
        since: i64,
        until: i64,
        limit: usize,
    ) -> crate::Result<Vec<LogEvent>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT ts, level, source, message FROM logs
             WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![since, until, limit as i64], |row| {
            Ok(LogEvent {
                ts: row.get(0)?,
                level: row.get(1)?,
                source: row.get(2)?,
                message: row.get(3)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn query_metrics(
        &self,
        since: i64,
        until: i64,
        limit: usize,
    ) -> crate::Result<Vec<MetricSample>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT ts, name, value, labels FROM metrics
             WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![since, until, limit as i64], |row| {
            Ok(MetricSample {
                ts: row.get(0)?,
                name: row.get(1)?,
                value: row.get(2)?,
                labels: row.get(3)?,
            })
        })?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }
}

impl Sink for SqliteSink {
    fn log(&self, event: LogEvent) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = conn.execute(
            "INSERT INTO logs (ts, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![event.ts, event.level, event.source, event.message],
        ) {
            tracing::warn!("observe: log write failed: {}", e);
        }
    }

    fn metric(&self, sample: MetricSample) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = conn.execute(
            "INSERT INTO metrics (ts, name, value, labels) VALUES (?1, ?2, ?3, ?4)",
            params![sample.ts, sample.name, sample.value, sample.labels],
        ) {
            tracing::warn!("observe: metric write failed: {}", e);
        }
    }
}
