//! Wire-level payload shapes for the DNS server API.
//!
//! Everything here is loosely typed the way the server reports it; the
//! conversion helpers reject ambiguity at this boundary so the rest of the
//! daemon only sees well-formed records.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use shared::types::QueryLogEntry;

/// Standard response envelope: every endpoint wraps its payload in
/// `{ "status": "...", "response": { ... } }`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    pub response: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct DhcpLeasesResponse {
    #[serde(default)]
    pub leases: Vec<RawLease>,
}

/// A DHCP lease exactly as the server reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLease {
    pub address: Option<String>,
    pub hardware_address: Option<String>,
    pub host_name: Option<String>,
    pub client_identifier: Option<String>,
    pub lease_obtained: Option<String>,
    pub lease_expires: Option<String>,
    pub scope: Option<String>,
    #[serde(rename = "type")]
    pub lease_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryLogsResponse {
    #[serde(default)]
    pub entries: Vec<RawLogEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLogEntry {
    pub client_ip_address: Option<String>,
    pub timestamp: Option<String>,
    pub protocol: Option<String>,
    pub question: Option<RawQuestion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQuestion {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
}

/// Verdict of the query-log capability probe.
#[derive(Debug, Clone)]
pub struct LogCapability {
    pub available: bool,
    pub message: String,
}

impl RawLogEntry {
    /// Convert to the canonical entry. Returns None when the client IP is
    /// missing or the timestamp does not parse; such entries are dropped at
    /// this boundary.
    pub fn into_entry(self) -> Option<QueryLogEntry> {
        let client_ip = self.client_ip_address.filter(|ip| !ip.is_empty())?;
        let timestamp = parse_timestamp(self.timestamp.as_deref()?)?;
        let question = self.question.unwrap_or_default();

        Some(QueryLogEntry {
            client_ip,
            timestamp,
            protocol: self.protocol.unwrap_or_else(|| "UDP".to_string()),
            question_name: question.name.unwrap_or_default(),
            question_type: question.record_type.unwrap_or_default(),
        })
    }
}

/// Parse a server timestamp. The API emits ISO-8601, usually with a trailing
/// `Z`, occasionally without any offset; offset-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zulu_and_offset_timestamps() {
        let zulu = parse_timestamp("2024-01-15T10:30:00.000Z").unwrap();
        let offset = parse_timestamp("2024-01-15T10:30:00+00:00").unwrap();
        assert_eq!(zulu, offset);
    }

    #[test]
    fn parses_offsetless_timestamp_as_utc() {
        let dt = parse_timestamp("2024-01-15T10:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn entry_conversion_drops_malformed() {
        let good = RawLogEntry {
            client_ip_address: Some("192.168.1.10".to_string()),
            timestamp: Some("2024-01-15T10:30:00Z".to_string()),
            protocol: None,
            question: Some(RawQuestion {
                name: Some("example.com".to_string()),
                record_type: Some("A".to_string()),
            }),
        };
        let entry = good.into_entry().unwrap();
        assert_eq!(entry.client_ip, "192.168.1.10");
        assert_eq!(entry.protocol, "UDP");

        let no_ip = RawLogEntry {
            timestamp: Some("2024-01-15T10:30:00Z".to_string()),
            ..Default::default()
        };
        assert!(no_ip.into_entry().is_none());

        let bad_ts = RawLogEntry {
            client_ip_address: Some("192.168.1.10".to_string()),
            timestamp: Some("not a time".to_string()),
            ..Default::default()
        };
        assert!(bad_ts.into_entry().is_none());
    }
}
