use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use shared::types::{LeaseKind, PresenceMethod, PresenceRecord};

/// SQLite-backed device presence store.
///
/// The coordinator is the only writer; it commits whole cycles. Rows for
/// vanished devices are kept with `present = 0` until an explicit `remove`.
pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open or create the database with WAL mode enabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                mac                 TEXT PRIMARY KEY,
                ip                  TEXT NOT NULL,
                hostname            TEXT,
                kind                TEXT NOT NULL,
                scope               TEXT,
                lease_obtained      TEXT,
                lease_expires       TEXT,
                method              TEXT NOT NULL,
                is_stale            INTEGER NOT NULL,
                last_seen           TEXT,
                minutes_since_seen  INTEGER NOT NULL,
                assessment          TEXT,
                first_seen          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                present             INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_devices_present ON devices(present);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or update a device record. `first_seen` from an existing row
    /// wins over the incoming value.
    pub fn upsert_record(&self, record: &PresenceRecord) -> Result<()> {
        let assessment_json = record
            .assessment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize assessment")?;

        self.conn
            .execute(
                r#"
                INSERT INTO devices (
                    mac, ip, hostname, kind, scope, lease_obtained, lease_expires,
                    method, is_stale, last_seen, minutes_since_seen, assessment,
                    first_seen, updated_at, present
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(mac) DO UPDATE SET
                    ip = excluded.ip,
                    hostname = excluded.hostname,
                    kind = excluded.kind,
                    scope = excluded.scope,
                    lease_obtained = excluded.lease_obtained,
                    lease_expires = excluded.lease_expires,
                    method = excluded.method,
                    is_stale = excluded.is_stale,
                    last_seen = excluded.last_seen,
                    minutes_since_seen = excluded.minutes_since_seen,
                    assessment = excluded.assessment,
                    updated_at = excluded.updated_at,
                    present = excluded.present
                "#,
                params![
                    &record.mac_address,
                    &record.ip_address,
                    &record.hostname,
                    record.kind.as_str(),
                    &record.scope,
                    record.lease_obtained.map(|t| t.to_rfc3339()),
                    record.lease_expires.map(|t| t.to_rfc3339()),
                    record.method.as_str(),
                    record.is_stale as i32,
                    record.last_seen.map(|t| t.to_rfc3339()),
                    record.minutes_since_seen,
                    assessment_json,
                    record.first_seen.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.present as i32,
                ],
            )
            .context("Failed to upsert device record")?;

        Ok(())
    }

    /// Clear the `present` flag for vanished devices. Their rows stay.
    pub fn mark_absent(&self, macs: &[String], now: DateTime<Utc>) -> Result<usize> {
        let now_str = now.to_rfc3339();
        let mut changed = 0;
        for mac in macs {
            changed += self
                .conn
                .execute(
                    "UPDATE devices SET present = 0, updated_at = ?1 WHERE mac = ?2",
                    params![now_str, mac],
                )
                .context("Failed to mark device absent")?;
        }
        Ok(changed)
    }

    /// MACs of devices that were in the most recent successful poll.
    pub fn present_macs(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT mac FROM devices WHERE present = 1")
            .context("Failed to prepare query")?;

        let macs = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query present devices")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to collect present devices")?;

        Ok(macs)
    }

    pub fn get_all(&self) -> Result<Vec<PresenceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM devices ORDER BY mac"))
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map([], |row| Self::row_to_record(row))
            .context("Failed to query devices")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect devices")?;

        Ok(records)
    }

    pub fn get(&self, mac: &str) -> Result<Option<PresenceRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM devices WHERE mac = ?1"),
                params![mac],
                |row| Self::row_to_record(row),
            )
            .optional()
            .context("Failed to query device")?;

        Ok(result)
    }

    /// Delete a device row outright. This is the explicit downstream removal
    /// act; the polling cycle never calls it.
    pub fn remove(&self, mac: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM devices WHERE mac = ?1", params![mac])
            .context("Failed to remove device")?;
        Ok(deleted > 0)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<PresenceRecord, rusqlite::Error> {
        let kind_str: String = row.get(3)?;
        let method_str: String = row.get(7)?;
        let is_stale: i32 = row.get(8)?;
        let assessment_json: Option<String> = row.get(11)?;
        let present: i32 = row.get(14)?;

        let method = PresenceMethod::parse(&method_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown presence method: {method_str}").into(),
            )
        })?;

        let assessment = assessment_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    11,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(PresenceRecord {
            mac_address: row.get(0)?,
            ip_address: row.get(1)?,
            hostname: row.get(2)?,
            kind: LeaseKind::parse(Some(&kind_str)),
            scope: row.get(4)?,
            lease_obtained: parse_optional_time(row, 5)?,
            lease_expires: parse_optional_time(row, 6)?,
            method,
            is_stale: is_stale != 0,
            last_seen: parse_optional_time(row, 9)?,
            minutes_since_seen: row.get(10)?,
            assessment,
            first_seen: parse_time(row, 12)?,
            updated_at: parse_time(row, 13)?,
            present: present != 0,
        })
    }
}

/// Columns in the order `row_to_record` reads them.
const COLUMNS: &str = "mac, ip, hostname, kind, scope, lease_obtained, lease_expires, \
                       method, is_stale, last_seen, minutes_since_seen, assessment, \
                       first_seen, updated_at, present";

fn parse_time(row: &rusqlite::Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_time(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    })
    .transpose()
}
