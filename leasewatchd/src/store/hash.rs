use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::PresenceRecord;

/// Hash only fields that represent meaningful state — timestamps, minute
/// counters and per-cycle assessments churn on every poll without the device
/// view actually changing.
#[derive(Serialize)]
struct HashView<'a> {
    mac: &'a str,
    ip: &'a str,
    hostname: Option<&'a str>,
    kind: &'a str,
    method: &'a str,
    is_stale: bool,
    present: bool,
}

/// Computes a SHA-256 hash of the device view, sorted by MAC for
/// deterministic output.
pub fn compute_hash(records: &[PresenceRecord]) -> String {
    let mut indices: Vec<usize> = (0..records.len()).collect();
    indices.sort_by(|&a, &b| records[a].mac_address.cmp(&records[b].mac_address));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let r = &records[i];
            HashView {
                mac: &r.mac_address,
                ip: &r.ip_address,
                hostname: r.hostname.as_deref(),
                kind: r.kind.as_str(),
                method: r.method.as_str(),
                is_stale: r.is_stale,
                present: r.present,
            }
        })
        .collect();

    let json = serde_json::to_string(&views).expect("Failed to serialize device view for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
