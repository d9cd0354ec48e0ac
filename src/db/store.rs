//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::diagnostics::DiagnosticBundle;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Corrupt column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Persistence operations the monitoring core depends on.
///
/// `Store` is the SQLite implementation; tests substitute failing stores.
pub trait TargetStore: Send + Sync {
    fn get_target(&self, id: i64) -> Result<Target, DbError>;
    fn get_targets(&self) -> Result<Vec<Target>, DbError>;
    fn get_targets_by_kind(&self, kind: TargetKind) -> Result<Vec<Target>, DbError>;
    fn update_target_status(&self, id: i64, update: &StatusUpdate) -> Result<(), DbError>;

    fn create_incident(
        &self,
        target_id: i64,
        started_at: DateTime<Utc>,
        cause: &str,
    ) -> Result<Incident, DbError>;
    /// Most recent unresolved incident for the target.
    fn find_open_incident(&self, target_id: i64) -> Result<Option<Incident>, DbError>;
    /// Persist the closing fields of an incident.
    fn close_incident(&self, incident: &Incident) -> Result<(), DbError>;
    fn get_incidents(&self, target_id: i64) -> Result<Vec<Incident>, DbError>;

    fn add_probe_outcomes(&self, target_id: i64, outcomes: &[ProbeOutcome]) -> Result<(), DbError>;
    fn add_check(&self, check: &CheckRecord) -> Result<(), DbError>;
    fn get_checks(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CheckRecord>, DbError>;

    /// Append the signal and advance the target's `last_signal_at`.
    fn record_heartbeat_signal(&self, signal: &HeartbeatSignal) -> Result<(), DbError>;
    fn add_diagnostic_bundle(&self, bundle: &DiagnosticBundle) -> Result<(), DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const TARGET_COLUMNS: &str = "id, name, kind, address, port, method, headers, body, auth, interval_secs, \
     status, last_checked_at, last_latency_ms, last_status_code, heartbeat_interval_secs, \
     last_signal_at, channels";

const INCIDENT_COLUMNS: &str =
    "id, target_id, started_at, ended_at, resolved, cause, resolution_method, duration_minutes";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        if target.interval_secs == 0 {
            target.interval_secs = 300;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, kind, address, port, method, headers, body, auth, interval_secs, \
             status, heartbeat_interval_secs, last_signal_at, channels) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                target.name,
                target.kind.as_str(),
                target.address,
                target.port,
                target.method,
                serde_json::to_string(&target.headers)?,
                target.body,
                serde_json::to_string(&target.auth)?,
                target.interval_secs as i64,
                target.status.as_str(),
                target.heartbeat_interval_secs.map(|s| s as i64),
                target.last_signal_at.map(format_db_time),
                serde_json::to_string(&target.channels)?,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Delete a target and everything recorded for it.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM diagnostic_bundles WHERE incident_id IN (SELECT id FROM incidents WHERE target_id = ?1)",
            params![id],
        )?;
        conn.execute("DELETE FROM incidents WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM probe_outcomes WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM checks WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM heartbeat_signals WHERE target_id = ?1", params![id])?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Get probe outcomes recorded for a target, oldest first.
    pub fn get_probe_outcomes(&self, target_id: i64) -> Result<Vec<ProbeOutcome>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT vantage, class, latency_ms, status_code, error, time FROM probe_outcomes \
             WHERE target_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![target_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<u16>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(vantage, class, latency_ms, status_code, error, time)| {
                Ok(ProbeOutcome {
                    vantage,
                    class: class.parse().map_err(|_| DbError::Corrupt {
                        column: "class",
                        value: class.clone(),
                    })?,
                    latency_ms,
                    status_code,
                    error,
                    timestamp: parse_required_time("time", &time)?,
                })
            })
            .collect()
    }

    /// Get diagnostic bundles recorded for an incident.
    pub fn get_diagnostic_bundles(&self, incident_id: i64) -> Result<Vec<DiagnosticBundle>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT incident_id, vantage, collected_at, dns, trace, http_timing, tls, geo \
             FROM diagnostic_bundles WHERE incident_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![incident_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(incident_id, vantage, collected_at, dns, trace, http_timing, tls, geo)| {
                Ok(DiagnosticBundle {
                    incident_id,
                    vantage,
                    collected_at: parse_required_time("collected_at", &collected_at)?,
                    dns: serde_json::from_str(&dns)?,
                    trace: serde_json::from_str(&trace)?,
                    http_timing: serde_json::from_str(&http_timing)?,
                    tls: serde_json::from_str(&tls)?,
                    geo: serde_json::from_str(&geo)?,
                })
            })
            .collect()
    }

    fn query_targets(&self, filter: Option<TargetKind>) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let rows = match filter {
            Some(kind) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM targets WHERE kind = ?1 ORDER BY id ASC",
                    TARGET_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![kind.as_str()], TargetRow::from_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM targets ORDER BY id ASC", TARGET_COLUMNS))?;
                let rows = stmt
                    .query_map([], TargetRow::from_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(TargetRow::into_target).collect()
    }
}

impl TargetStore for Store {
    fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id],
                TargetRow::from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        row.into_target()
    }

    fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        self.query_targets(None)
    }

    fn get_targets_by_kind(&self, kind: TargetKind) -> Result<Vec<Target>, DbError> {
        self.query_targets(Some(kind))
    }

    fn update_target_status(&self, id: i64, update: &StatusUpdate) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET status = ?1, last_checked_at = ?2, \
             last_latency_ms = COALESCE(?3, last_latency_ms), \
             last_status_code = COALESCE(?4, last_status_code) WHERE id = ?5",
            params![
                update.status.as_str(),
                format_db_time(update.checked_at),
                update.latency_ms,
                update.status_code,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn create_incident(
        &self,
        target_id: i64,
        started_at: DateTime<Utc>,
        cause: &str,
    ) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (target_id, started_at, resolved, cause) VALUES (?1, ?2, 0, ?3)",
            params![target_id, format_db_time(started_at), cause],
        )?;
        Ok(Incident {
            id: conn.last_insert_rowid(),
            target_id,
            started_at,
            ended_at: None,
            resolved: false,
            cause: cause.to_string(),
            resolution_method: None,
            duration_minutes: None,
        })
    }

    fn find_open_incident(&self, target_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE target_id = ?1 AND resolved = 0 \
                     ORDER BY started_at DESC, id DESC LIMIT 1",
                    INCIDENT_COLUMNS
                ),
                params![target_id],
                IncidentRow::from_row,
            )
            .optional()?;
        row.map(IncidentRow::into_incident).transpose()
    }

    fn close_incident(&self, incident: &Incident) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE incidents SET ended_at = ?1, resolved = ?2, resolution_method = ?3, \
             duration_minutes = ?4 WHERE id = ?5",
            params![
                incident.ended_at.map(format_db_time),
                incident.resolved,
                incident.resolution_method.map(|m| m.as_str()),
                incident.duration_minutes,
                incident.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn get_incidents(&self, target_id: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE target_id = ?1 ORDER BY started_at ASC, id ASC",
            INCIDENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![target_id], IncidentRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().map(IncidentRow::into_incident).collect()
    }

    fn add_probe_outcomes(&self, target_id: i64, outcomes: &[ProbeOutcome]) -> Result<(), DbError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_outcomes (target_id, vantage, class, latency_ms, status_code, error, time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for o in outcomes {
                stmt.execute(params![
                    target_id,
                    o.vantage,
                    o.class.as_str(),
                    o.latency_ms,
                    o.status_code,
                    o.error,
                    format_db_time(o.timestamp),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn add_check(&self, check: &CheckRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checks (target_id, checked_at, status, latency_ms, status_code, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                check.target_id,
                format_db_time(check.checked_at),
                check.status.as_str(),
                check.latency_ms,
                check.status_code,
                check.error,
            ],
        )?;
        Ok(())
    }

    fn get_checks(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CheckRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT target_id, checked_at, status, latency_ms, status_code, error FROM checks \
             WHERE target_id = ?1 AND checked_at >= ?2 AND checked_at < ?3 ORDER BY checked_at ASC",
        )?;

        let rows = stmt
            .query_map(
                params![target_id, format_db_time(start), format_db_time(end)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<u16>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(target_id, checked_at, status, latency_ms, status_code, error)| {
                Ok(CheckRecord {
                    target_id,
                    checked_at: parse_required_time("checked_at", &checked_at)?,
                    status: parse_status(&status)?,
                    latency_ms,
                    status_code,
                    error,
                })
            })
            .collect()
    }

    fn record_heartbeat_signal(&self, signal: &HeartbeatSignal) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO heartbeat_signals (target_id, received_at, status, latency_ms, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                signal.target_id,
                format_db_time(signal.received_at),
                signal.status,
                signal.latency_ms,
                signal
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        let changed = tx.execute(
            "UPDATE targets SET last_signal_at = MAX(COALESCE(last_signal_at, ?1), ?1) WHERE id = ?2",
            params![format_db_time(signal.received_at), signal.target_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }

        tx.commit()?;
        Ok(())
    }

    fn add_diagnostic_bundle(&self, bundle: &DiagnosticBundle) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO diagnostic_bundles (incident_id, vantage, collected_at, dns, trace, http_timing, tls, geo) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                bundle.incident_id,
                bundle.vantage,
                format_db_time(bundle.collected_at),
                serde_json::to_string(&bundle.dns)?,
                serde_json::to_string(&bundle.trace)?,
                serde_json::to_string(&bundle.http_timing)?,
                serde_json::to_string(&bundle.tls)?,
                serde_json::to_string(&bundle.geo)?,
            ],
        )?;
        Ok(())
    }
}

/// Raw column values of a `targets` row, decoded outside the rusqlite closure.
struct TargetRow {
    id: i64,
    name: String,
    kind: String,
    address: String,
    port: Option<u16>,
    method: String,
    headers: String,
    body: Option<String>,
    auth: String,
    interval_secs: i64,
    status: String,
    last_checked_at: Option<String>,
    last_latency_ms: Option<f64>,
    last_status_code: Option<u16>,
    heartbeat_interval_secs: Option<i64>,
    last_signal_at: Option<String>,
    channels: String,
}

impl TargetRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            address: row.get(3)?,
            port: row.get(4)?,
            method: row.get(5)?,
            headers: row.get(6)?,
            body: row.get(7)?,
            auth: row.get(8)?,
            interval_secs: row.get(9)?,
            status: row.get(10)?,
            last_checked_at: row.get(11)?,
            last_latency_ms: row.get(12)?,
            last_status_code: row.get(13)?,
            heartbeat_interval_secs: row.get(14)?,
            last_signal_at: row.get(15)?,
            channels: row.get(16)?,
        })
    }

    fn into_target(self) -> Result<Target, DbError> {
        Ok(Target {
            id: self.id,
            name: self.name,
            kind: self.kind.parse().map_err(|_| DbError::Corrupt {
                column: "kind",
                value: self.kind.clone(),
            })?,
            address: self.address,
            port: self.port,
            method: self.method,
            headers: serde_json::from_str(&self.headers)?,
            body: self.body,
            auth: serde_json::from_str(&self.auth)?,
            interval_secs: self.interval_secs.max(0) as u64,
            status: parse_status(&self.status)?,
            last_checked_at: parse_optional_time("last_checked_at", self.last_checked_at)?,
            last_latency_ms: self.last_latency_ms,
            last_status_code: self.last_status_code,
            heartbeat_interval_secs: self.heartbeat_interval_secs.map(|s| s.max(0) as u64),
            last_signal_at: parse_optional_time("last_signal_at", self.last_signal_at)?,
            channels: serde_json::from_str(&self.channels)?,
        })
    }
}

struct IncidentRow {
    id: i64,
    target_id: i64,
    started_at: String,
    ended_at: Option<String>,
    resolved: bool,
    cause: String,
    resolution_method: Option<String>,
    duration_minutes: Option<i64>,
}

impl IncidentRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            resolved: row.get(4)?,
            cause: row.get(5)?,
            resolution_method: row.get(6)?,
            duration_minutes: row.get(7)?,
        })
    }

    fn into_incident(self) -> Result<Incident, DbError> {
        let resolution_method = match self.resolution_method {
            Some(m) => Some(m.parse().map_err(|_| DbError::Corrupt {
                column: "resolution_method",
                value: m.clone(),
            })?),
            None => None,
        };

        Ok(Incident {
            id: self.id,
            target_id: self.target_id,
            started_at: parse_required_time("started_at", &self.started_at)?,
            ended_at: parse_optional_time("ended_at", self.ended_at)?,
            resolved: self.resolved,
            cause: self.cause,
            resolution_method,
            duration_minutes: self.duration_minutes,
        })
    }
}

fn parse_status(s: &str) -> Result<TargetStatus, DbError> {
    s.parse().map_err(|_| DbError::Corrupt {
        column: "status",
        value: s.to_string(),
    })
}

fn parse_required_time(column: &'static str, s: &str) -> Result<DateTime<Utc>, DbError> {
    parse_db_time(s).ok_or_else(|| DbError::Corrupt {
        column,
        value: s.to_string(),
    })
}

fn parse_optional_time(
    column: &'static str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, DbError> {
    s.map(|s| parse_required_time(column, &s)).transpose()
}

/// Format a timestamp so that lexical order matches time order.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
