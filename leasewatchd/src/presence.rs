//! Per-device presence determination with a graceful degradation chain.
//!
//! The method is selected once per polling cycle and applied to every device
//! in that cycle, so consumers never see records from one poll determined by
//! mixed methods.

use chrono::{DateTime, Utc};
use shared::types::{
    ActivityAssessment, DeviceLease, PresenceMethod, PresenceRecord, QueryLogEntry,
    NEVER_SEEN_MINUTES,
};

/// Pick the presence method for a whole cycle.
///
/// Degradation order: smart scoring needs the log source available and a
/// non-empty fetch; last-seen needs the log source; without it, lease
/// presence is all that remains. Loss of telemetry must never make
/// previously-tracked devices disappear.
pub fn select_method(
    log_tracking: bool,
    smart_activity: bool,
    log_source_available: bool,
    has_entries: bool,
) -> PresenceMethod {
    if !log_tracking || !log_source_available {
        PresenceMethod::DhcpOnly
    } else if smart_activity && has_entries {
        PresenceMethod::SmartActivity
    } else {
        PresenceMethod::LastSeen
    }
}

/// Most recent log timestamp for a device IP, if any.
pub fn last_seen_for(ip: &str, entries: &[QueryLogEntry]) -> Option<DateTime<Utc>> {
    entries
        .iter()
        .filter(|e| e.client_ip == ip)
        .map(|e| e.timestamp)
        .max()
}

pub fn minutes_since(now: DateTime<Utc>, seen: DateTime<Utc>) -> i64 {
    (now - seen).num_minutes().max(0)
}

fn base_record(lease: &DeviceLease, method: PresenceMethod, now: DateTime<Utc>) -> PresenceRecord {
    PresenceRecord {
        mac_address: lease.mac_address.clone(),
        ip_address: lease.ip_address.clone(),
        hostname: lease.hostname.clone(),
        kind: lease.kind.clone(),
        scope: lease.scope.clone(),
        lease_obtained: lease.lease_obtained,
        lease_expires: lease.lease_expires,
        method,
        is_stale: false,
        last_seen: None,
        minutes_since_seen: 0,
        assessment: None,
        first_seen: now,
        updated_at: now,
        present: true,
    }
}

/// Log source unavailable or log tracking disabled: every leased device is
/// treated as active.
pub fn resolve_dhcp_only(lease: &DeviceLease, now: DateTime<Utc>) -> PresenceRecord {
    base_record(lease, PresenceMethod::DhcpOnly, now)
}

/// Binary last-seen rule: stale once the device has been quiet longer than
/// the threshold; never-seen devices are stale with the sentinel.
pub fn resolve_last_seen(
    lease: &DeviceLease,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_threshold_minutes: i64,
) -> PresenceRecord {
    let mut record = base_record(lease, PresenceMethod::LastSeen, now);
    match last_seen {
        Some(seen) => {
            let minutes = minutes_since(now, seen);
            record.last_seen = Some(seen);
            record.minutes_since_seen = minutes;
            record.is_stale = minutes > stale_threshold_minutes;
        }
        None => {
            record.minutes_since_seen = NEVER_SEEN_MINUTES;
            record.is_stale = true;
        }
    }
    record
}

/// Smart scoring: staleness follows the genuine-use verdict.
pub fn resolve_smart(
    lease: &DeviceLease,
    assessment: ActivityAssessment,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PresenceRecord {
    let mut record = base_record(lease, PresenceMethod::SmartActivity, now);
    record.is_stale = !assessment.is_actively_used;
    record.last_seen = last_seen;
    record.minutes_since_seen = match last_seen {
        Some(seen) => minutes_since(now, seen),
        None => NEVER_SEEN_MINUTES,
    };
    record.assessment = Some(assessment);
    record
}
