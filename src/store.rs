//! Persistent host records.
//!
//! One row per IP. Only the durable fields live here; liveness and the
//! in-progress flag are registry-only state.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{LanWatchError, Result};
use crate::ports::{format_port_list, parse_port_list};

/// The persisted shape of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub ip: String,
    pub mac: String,
    pub vendor: String,
    pub hostname: String,
    pub dns_name: String,
    pub is_dhcp: bool,
    pub last_seen: OffsetDateTime,
    pub open_ports: BTreeSet<u16>,
}

/// Explicit, user-supplied metadata. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMetadata {
    pub hostname: Option<String>,
    pub dns_name: Option<String>,
    pub is_dhcp: Option<bool>,
}

/// Every method commits before returning.
pub trait HostStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<HostRecord>>;
    fn get(&self, ip: &str) -> Result<Option<HostRecord>>;
    /// Insert the row if missing, then overwrite mac, vendor and last_seen.
    fn record_sighting(&self, ip: &str, mac: &str, vendor: &str, seen: OffsetDateTime) -> Result<()>;
    /// Insert the row if missing, then overwrite the serialized port list.
    fn save_ports(&self, ip: &str, ports: &BTreeSet<u16>) -> Result<()>;
    /// Insert the row if missing, then apply the provided fields.
    fn update_metadata(&self, ip: &str, meta: &HostMetadata) -> Result<HostRecord>;
    fn set_vendor(&self, ip: &str, vendor: &str) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hosts (
    id               INTEGER PRIMARY KEY,
    ip               TEXT NOT NULL UNIQUE,
    mac              TEXT NOT NULL DEFAULT '',
    vendor           TEXT NOT NULL DEFAULT 'Unknown',
    hostname         TEXT NOT NULL DEFAULT '',
    dns_name         TEXT NOT NULL DEFAULT '',
    is_dhcp          INTEGER NOT NULL DEFAULT 0,
    last_seen        TEXT NOT NULL,
    port_scan_result TEXT NOT NULL DEFAULT ''
);";

const SELECT_COLUMNS: &str =
    "SELECT ip, mac, vendor, hostname, dns_name, is_dhcp, last_seen, port_scan_result FROM hosts";

/// SQLite-backed store. The connection sits behind a mutex; statements are short.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened host store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| LanWatchError::StoreCorrupt("connection mutex poisoned".into()))?;
        f(&conn)
    }
}

fn ensure_row(conn: &Connection, ip: &str, now: OffsetDateTime) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO hosts (ip, last_seen) VALUES (?1, ?2)",
        params![ip, format_ts(now)?],
    )?;
    Ok(())
}

fn format_ts(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| LanWatchError::StoreCorrupt(format!("timestamp format: {e}")))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(HostRecord, String)> {
    let last_seen: String = row.get(6)?;
    let ports: String = row.get(7)?;
    Ok((
        HostRecord {
            ip: row.get(0)?,
            mac: row.get(1)?,
            vendor: row.get(2)?,
            hostname: row.get(3)?,
            dns_name: row.get(4)?,
            is_dhcp: row.get(5)?,
            last_seen: OffsetDateTime::UNIX_EPOCH,
            open_ports: parse_port_list(&ports),
        },
        last_seen,
    ))
}

fn finish_record((mut rec, ts): (HostRecord, String)) -> Result<HostRecord> {
    rec.last_seen = OffsetDateTime::parse(&ts, &Rfc3339)
        .map_err(|e| LanWatchError::StoreCorrupt(format!("bad last_seen for {}: {e}", rec.ip)))?;
    Ok(rec)
}

fn select_one(conn: &Connection, ip: &str) -> Result<Option<HostRecord>> {
    let raw = conn
        .query_row(&format!("{SELECT_COLUMNS} WHERE ip = ?1"), params![ip], row_to_record)
        .optional()?;
    raw.map(finish_record).transpose()
}

impl HostStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<HostRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(finish_record(row?)?);
            }
            Ok(out)
        })
    }

    fn get(&self, ip: &str) -> Result<Option<HostRecord>> {
        self.with_conn(|conn| select_one(conn, ip))
    }

    fn record_sighting(&self, ip: &str, mac: &str, vendor: &str, seen: OffsetDateTime) -> Result<()> {
        self.with_conn(|conn| {
            let ts = format_ts(seen)?;
            conn.execute(
                "INSERT INTO hosts (ip, mac, vendor, last_seen) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ip) DO UPDATE SET mac = excluded.mac, vendor = excluded.vendor,
                 last_seen = excluded.last_seen",
                params![ip, mac, vendor, ts],
            )?;
            Ok(())
        })
    }

    fn save_ports(&self, ip: &str, ports: &BTreeSet<u16>) -> Result<()> {
        self.with_conn(|conn| {
            ensure_row(conn, ip, OffsetDateTime::now_utc())?;
            conn.execute(
                "UPDATE hosts SET port_scan_result = ?2 WHERE ip = ?1",
                params![ip, format_port_list(ports)],
            )?;
            Ok(())
        })
    }

    fn update_metadata(&self, ip: &str, meta: &HostMetadata) -> Result<HostRecord> {
        self.with_conn(|conn| {
            ensure_row(conn, ip, OffsetDateTime::now_utc())?;
            if let Some(hostname) = &meta.hostname {
                conn.execute("UPDATE hosts SET hostname = ?2 WHERE ip = ?1", params![ip, hostname])?;
            }
            if let Some(dns_name) = &meta.dns_name {
                conn.execute("UPDATE hosts SET dns_name = ?2 WHERE ip = ?1", params![ip, dns_name])?;
            }
            if let Some(is_dhcp) = meta.is_dhcp {
                conn.execute("UPDATE hosts SET is_dhcp = ?2 WHERE ip = ?1", params![ip, is_dhcp])?;
            }
            select_one(conn, ip)?
                .ok_or_else(|| LanWatchError::NotFound(format!("host {ip} vanished during update")))
        })
    }

    fn set_vendor(&self, ip: &str, vendor: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE hosts SET vendor = ?2 WHERE ip = ?1", params![ip, vendor])?;
            Ok(())
        })
    }
}
