//! Turns raw DHCP lease payloads into canonical `DeviceLease` records.

use shared::types::{DeviceLease, LeaseKind};
use tracing::debug;

use crate::ipfilter::IpFilter;
use crate::source::types::{parse_timestamp, RawLease};

/// Normalize a MAC address to uppercase colon-separated form.
///
/// `aa-bb-cc-dd-ee-ff`, `aabbccddeeff` and `aa:bb:cc:dd:ee:ff` all become
/// `AA:BB:CC:DD:EE:FF`. Anything that is neither 12 nor 17 characters long
/// is passed through uppercased unchanged.
pub fn normalize_mac(mac: &str) -> String {
    let upper = mac.to_uppercase();
    match upper.len() {
        12 => upper
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":"),
        17 => upper.replace('-', ":"),
        _ => upper,
    }
}

/// Per-cycle counts of what the normalizer did, for the cycle summary log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub accepted: usize,
    pub skipped: usize,
    pub filtered: usize,
}

/// Normalize raw leases, skipping unusable entries and applying the IP
/// filter. Missing IP or MAC skips the lease; unknown lease types are
/// accepted as-is.
pub fn normalize_leases(
    raw_leases: Vec<RawLease>,
    filter: &IpFilter,
) -> (Vec<DeviceLease>, NormalizeStats) {
    let mut leases = Vec::with_capacity(raw_leases.len());
    let mut stats = NormalizeStats::default();

    for raw in raw_leases {
        let Some(ip_address) = raw.address.filter(|ip| !ip.is_empty()) else {
            debug!("skipping lease with no IP address");
            stats.skipped += 1;
            continue;
        };
        let Some(mac) = raw.hardware_address.filter(|mac| !mac.is_empty()) else {
            debug!(ip = %ip_address, "skipping lease with no MAC address");
            stats.skipped += 1;
            continue;
        };

        if !filter.should_track(&ip_address) {
            debug!(ip = %ip_address, "lease excluded by IP filter");
            stats.filtered += 1;
            continue;
        }

        let kind = LeaseKind::parse(raw.lease_type.as_deref());
        if let LeaseKind::Other(ref t) = kind {
            debug!(ip = %ip_address, lease_type = %t, "accepting lease with unknown type");
        }

        leases.push(DeviceLease {
            mac_address: normalize_mac(&mac),
            ip_address,
            hostname: raw.host_name.filter(|h| !h.is_empty()),
            client_id: raw.client_identifier.filter(|c| !c.is_empty()),
            kind,
            lease_obtained: raw.lease_obtained.as_deref().and_then(parse_timestamp),
            lease_expires: raw.lease_expires.as_deref().and_then(parse_timestamp),
            scope: raw.scope.filter(|s| !s.is_empty()),
        });
        stats.accepted += 1;
    }

    (leases, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterMode;

    fn raw(address: &str, mac: &str) -> RawLease {
        RawLease {
            address: Some(address.to_string()),
            hardware_address: Some(mac.to_string()),
            ..Default::default()
        }
    }

    fn no_filter() -> IpFilter {
        IpFilter::new(FilterMode::Disabled, "")
    }

    #[test]
    fn mac_normalization_is_format_invariant() {
        let canonical = "AA:BB:CC:DD:EE:FF";
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff"), canonical);
        assert_eq!(normalize_mac("AABBCCDDEEFF"), canonical);
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:ff"), canonical);
    }

    #[test]
    fn mac_normalization_is_idempotent() {
        let once = normalize_mac("aabbccddeeff");
        assert_eq!(normalize_mac(&once), once);
    }

    #[test]
    fn unexpected_mac_length_passes_through_uppercased() {
        assert_eq!(normalize_mac("aa:bb:cc"), "AA:BB:CC");
    }

    #[test]
    fn skips_leases_missing_ip_or_mac() {
        let raws = vec![
            RawLease {
                hardware_address: Some("aabbccddeeff".to_string()),
                ..Default::default()
            },
            RawLease {
                address: Some("192.168.1.10".to_string()),
                ..Default::default()
            },
            raw("192.168.1.11", "112233445566"),
        ];

        let (leases, stats) = normalize_leases(raws, &no_filter());
        assert_eq!(leases.len(), 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(leases[0].mac_address, "11:22:33:44:55:66");
    }

    #[test]
    fn accepts_unknown_lease_types() {
        let mut lease = raw("192.168.1.10", "aabbccddeeff");
        lease.lease_type = Some("BootpReserved".to_string());

        let (leases, stats) = normalize_leases(vec![lease], &no_filter());
        assert_eq!(stats.accepted, 1);
        assert_eq!(
            leases[0].kind,
            LeaseKind::Other("BootpReserved".to_string())
        );
    }

    #[test]
    fn empty_lease_type_is_dynamic() {
        let mut lease = raw("192.168.1.10", "aabbccddeeff");
        lease.lease_type = Some(String::new());

        let (leases, _) = normalize_leases(vec![lease], &no_filter());
        assert_eq!(leases[0].kind, LeaseKind::Dynamic);
    }

    #[test]
    fn applies_ip_filter() {
        let filter = IpFilter::new(FilterMode::Include, "192.168.1.100,192.168.1.101");
        let raws = vec![
            raw("192.168.1.100", "aabbccddeeff"),
            raw("192.168.1.50", "112233445566"),
        ];

        let (leases, stats) = normalize_leases(raws, &filter);
        assert_eq!(leases.len(), 1);
        assert_eq!(stats.filtered, 1);
        assert_eq!(leases[0].ip_address, "192.168.1.100");
    }

    #[test]
    fn parses_lease_timestamps_leniently() {
        let mut lease = raw("192.168.1.10", "aabbccddeeff");
        lease.lease_obtained = Some("2024-01-15T08:00:00Z".to_string());
        lease.lease_expires = Some("whenever".to_string());

        let (leases, _) = normalize_leases(vec![lease], &no_filter());
        assert!(leases[0].lease_obtained.is_some());
        assert!(leases[0].lease_expires.is_none());
    }
}
