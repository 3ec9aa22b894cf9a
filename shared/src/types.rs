use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel for "no DNS activity ever observed for this device".
pub const NEVER_SEEN_MINUTES: i64 = 9999;

/// Kind of DHCP lease as reported by the server.
///
/// The vendor lease-type vocabulary is not guaranteed exhaustive, so unknown
/// kinds are carried through as-is instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseKind {
    Dynamic,
    Reserved,
    Other(String),
}

impl LeaseKind {
    /// Parse the raw lease type field. Empty or missing means dynamic.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => LeaseKind::Dynamic,
            Some("Dynamic") => LeaseKind::Dynamic,
            Some("Reserved") => LeaseKind::Reserved,
            Some(other) => LeaseKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LeaseKind::Dynamic => "Dynamic",
            LeaseKind::Reserved => "Reserved",
            LeaseKind::Other(s) => s,
        }
    }
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LeaseKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LeaseKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(LeaseKind::parse(Some(&s)))
    }
}

/// A DHCP lease after normalization.
///
/// `mac_address` is the stable identity key: two leases with the same
/// normalized MAC refer to the same device even if the IP changed between
/// polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLease {
    /// Canonical colon-separated uppercase MAC, e.g. "AA:BB:CC:DD:EE:FF".
    pub mac_address: String,

    /// IP address as reported by the DHCP server.
    pub ip_address: String,

    /// Client hostname, when the server knows one.
    pub hostname: Option<String>,

    /// DHCP client identifier, when reported.
    pub client_id: Option<String>,

    /// Lease kind (dynamic, reserved, or vendor-specific).
    pub kind: LeaseKind,

    /// When the lease was obtained; None when absent or unparseable.
    pub lease_obtained: Option<DateTime<Utc>>,

    /// When the lease expires; None when absent or unparseable.
    pub lease_expires: Option<DateTime<Utc>>,

    /// DHCP scope name.
    pub scope: Option<String>,
}

/// A single DNS query log entry, windowed by the analysis lookback.
/// Ephemeral: lives for one polling cycle, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub client_ip: String,
    pub timestamp: DateTime<Utc>,
    /// Transport the query arrived over (UDP, TCP, HTTPS, HTTP, ...).
    pub protocol: String,
    pub question_name: String,
    pub question_type: String,
}

/// The five named sub-scores behind a composite activity score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub background: f64,
    pub protocol: f64,
    pub diversity: f64,
    pub frequency: f64,
    pub timing: f64,
}

/// Result of scoring one device's DNS query pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityAssessment {
    /// Composite genuine-use score, 0-100, one decimal.
    pub activity_score: f64,
    pub is_actively_used: bool,
    pub total_queries: u32,
    /// Fraction of queries classified as background traffic.
    pub background_ratio: f64,
    /// Count of distinct transport protocols seen.
    pub protocol_diversity: u32,
    /// Queries per minute over the analyzed span.
    pub query_rate: f64,
    pub analysis_summary: String,
    pub breakdown: ScoreBreakdown,
}

impl ActivityAssessment {
    /// The zero-assessment: no activity, not in use.
    pub fn inactive(summary: impl Into<String>) -> Self {
        Self {
            activity_score: 0.0,
            is_actively_used: false,
            total_queries: 0,
            background_ratio: 0.0,
            protocol_diversity: 0,
            query_rate: 0.0,
            analysis_summary: summary.into(),
            breakdown: ScoreBreakdown::default(),
        }
    }
}

/// How presence was determined for a polling cycle.
///
/// Exactly one method is active per cycle; it is recorded on every record of
/// that cycle so consumers can distinguish confidence levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMethod {
    /// Composite activity scoring over the query log window.
    SmartActivity,
    /// Binary last-seen-threshold rule.
    LastSeen,
    /// Lease presence only; the log source was unavailable or disabled.
    DhcpOnly,
}

impl PresenceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceMethod::SmartActivity => "smart_activity",
            PresenceMethod::LastSeen => "last_seen",
            PresenceMethod::DhcpOnly => "dhcp_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "smart_activity" => Some(PresenceMethod::SmartActivity),
            "last_seen" => Some(PresenceMethod::LastSeen),
            "dhcp_only" => Some(PresenceMethod::DhcpOnly),
            _ => None,
        }
    }
}

impl fmt::Display for PresenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final per-device state for one polling cycle: the lease merged with
/// whichever presence determination was active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub mac_address: String,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub kind: LeaseKind,
    pub scope: Option<String>,
    pub lease_obtained: Option<DateTime<Utc>>,
    pub lease_expires: Option<DateTime<Utc>>,

    pub method: PresenceMethod,
    pub is_stale: bool,
    pub last_seen: Option<DateTime<Utc>>,
    /// Minutes since last observed DNS activity; NEVER_SEEN_MINUTES when the
    /// device has no log entry at all.
    pub minutes_since_seen: i64,
    pub assessment: Option<ActivityAssessment>,

    /// First time this device was observed. Preserved across cycles.
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Whether the device was in the most recent successful poll. Vanished
    /// devices keep their record with present = false until an explicit
    /// removal.
    pub present: bool,
}

/// Device-set membership change between two consecutive successful polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSetDelta {
    /// Normalized MACs seen now but not in the previous poll.
    pub new: Vec<String>,
    /// Normalized MACs seen previously but absent now.
    pub removed: Vec<String>,
}

impl DeviceSetDelta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_kind_parse_treats_empty_as_dynamic() {
        assert_eq!(LeaseKind::parse(None), LeaseKind::Dynamic);
        assert_eq!(LeaseKind::parse(Some("")), LeaseKind::Dynamic);
        assert_eq!(LeaseKind::parse(Some("Dynamic")), LeaseKind::Dynamic);
        assert_eq!(LeaseKind::parse(Some("Reserved")), LeaseKind::Reserved);
        assert_eq!(
            LeaseKind::parse(Some("BootpAllocated")),
            LeaseKind::Other("BootpAllocated".to_string())
        );
    }

    #[test]
    fn presence_method_round_trips_as_str() {
        for method in [
            PresenceMethod::SmartActivity,
            PresenceMethod::LastSeen,
            PresenceMethod::DhcpOnly,
        ] {
            assert_eq!(PresenceMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(PresenceMethod::parse("bogus"), None);
    }

    #[test]
    fn inactive_assessment_is_zeroed() {
        let a = ActivityAssessment::inactive("No DNS activity found");
        assert_eq!(a.activity_score, 0.0);
        assert!(!a.is_actively_used);
        assert_eq!(a.total_queries, 0);
        assert_eq!(a.analysis_summary, "No DNS activity found");
    }
}
