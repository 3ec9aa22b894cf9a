//! IP inclusion/exclusion filtering for lease tracking.
//!
//! The range spec accepts single IPv4 addresses, CIDR blocks and
//! `start-end` ranges, separated by commas, semicolons or newlines.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::config::FilterMode;

/// Upper bound on a single entry's expansion. Anything larger is a config
/// mistake (a /8 block would expand to 16M addresses).
const MAX_ENTRY_ADDRS: u64 = 65_536;

/// Upper bound on the whole configured set, enforced at validation time.
const MAX_TOTAL_ADDRS: usize = 10_000;

/// A compiled IP filter. Built once per coordinator from configuration.
#[derive(Debug, Clone)]
pub struct IpFilter {
    mode: FilterMode,
    addrs: HashSet<Ipv4Addr>,
    active: bool,
}

impl IpFilter {
    pub fn new(mode: FilterMode, ranges_spec: &str) -> Self {
        let active = mode != FilterMode::Disabled && !ranges_spec.trim().is_empty();
        let addrs = if active {
            parse_ranges(ranges_spec)
        } else {
            HashSet::new()
        };
        Self { mode, addrs, active }
    }

    /// Whether a device at `ip` should be tracked. An IP that does not parse
    /// as IPv4 fails closed (excluded) while filtering is enabled.
    pub fn should_track(&self, ip: &str) -> bool {
        if !self.active {
            return true;
        }

        let addr: Ipv4Addr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(ip, "unparseable IP address, excluding from tracking");
                return false;
            }
        };

        match self.mode {
            FilterMode::Disabled => true,
            FilterMode::Include => self.addrs.contains(&addr),
            FilterMode::Exclude => !self.addrs.contains(&addr),
        }
    }
}

/// Expand a range spec into the set of individual addresses it names.
/// Invalid entries are skipped with a warning.
pub fn parse_ranges(spec: &str) -> HashSet<Ipv4Addr> {
    let mut addrs = HashSet::new();

    for entry in spec.split(|c| matches!(c, ',' | ';' | '\n')) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        if entry.contains('-') && !entry.contains('/') {
            expand_span(entry, &mut addrs);
        } else if entry.contains('/') {
            expand_cidr(entry, &mut addrs);
        } else {
            match entry.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    addrs.insert(addr);
                }
                Err(e) => warn!(entry, %e, "invalid IP address in ranges"),
            }
        }
    }

    debug!(count = addrs.len(), "parsed IP filter ranges");
    addrs
}

fn expand_span(entry: &str, addrs: &mut HashSet<Ipv4Addr>) {
    let Some((start_str, end_str)) = entry.split_once('-') else {
        return;
    };

    let start: Ipv4Addr = match start_str.trim().parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(entry, %e, "invalid range start");
            return;
        }
    };
    let end: Ipv4Addr = match end_str.trim().parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(entry, %e, "invalid range end");
            return;
        }
    };

    let (start, end) = (u32::from(start), u32::from(end));
    if start > end {
        warn!(entry, "range start is greater than end, skipping");
        return;
    }
    if u64::from(end - start) + 1 > MAX_ENTRY_ADDRS {
        warn!(entry, "range expands to too many addresses, skipping");
        return;
    }

    for raw in start..=end {
        addrs.insert(Ipv4Addr::from(raw));
    }
}

fn expand_cidr(entry: &str, addrs: &mut HashSet<Ipv4Addr>) {
    let Some((addr_str, prefix_str)) = entry.split_once('/') else {
        return;
    };

    let addr: Ipv4Addr = match addr_str.trim().parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(entry, %e, "invalid CIDR address");
            return;
        }
    };
    let prefix: u8 = match prefix_str.trim().parse() {
        Ok(p) if (1..=32).contains(&p) => p,
        _ => {
            warn!(entry, "invalid CIDR prefix length");
            return;
        }
    };

    // Host addresses only: the network and broadcast addresses are not
    // leaseable, except in the degenerate /31 and /32 cases.
    let raw = u32::from(addr);
    let (first, last) = match prefix {
        32 => (raw, raw),
        31 => {
            let network = raw & !1;
            (network, network | 1)
        }
        _ => {
            let mask = u32::MAX << (32 - prefix);
            let network = raw & mask;
            let broadcast = network | !mask;
            (network + 1, broadcast - 1)
        }
    };

    if u64::from(last - first) + 1 > MAX_ENTRY_ADDRS {
        warn!(entry, "CIDR block expands to too many addresses, skipping");
        return;
    }

    for raw in first..=last {
        addrs.insert(Ipv4Addr::from(raw));
    }
}

/// Validate a range spec for configuration. An empty spec is valid (the
/// filter is simply inert); a spec that yields nothing usable, or expands
/// past the supported size, is rejected.
pub fn validate_ranges(spec: &str) -> Result<()> {
    if spec.trim().is_empty() {
        return Ok(());
    }

    let addrs = parse_ranges(spec);
    if addrs.is_empty() {
        bail!("no valid IP addresses found in ranges");
    }
    if addrs.len() > MAX_TOTAL_ADDRS {
        bail!(
            "ranges expand to {} addresses, maximum {} allowed",
            addrs.len(),
            MAX_TOTAL_ADDRS
        );
    }
    Ok(())
}
