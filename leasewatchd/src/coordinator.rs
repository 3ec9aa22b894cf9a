//! Drives polling cycles end-to-end and reconciles the device population.
//!
//! One coordinator per configured DNS source. The retained device-set
//! snapshot and the store are only touched at cycle boundaries: a cycle
//! either commits completely or leaves everything exactly as it was.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use shared::types::{
    ActivityAssessment, DeviceLease, DeviceSetDelta, PresenceMethod, PresenceRecord, QueryLogEntry,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityAnalyzer;
use crate::config::TrackingConfig;
use crate::error::CycleError;
use crate::ipfilter::IpFilter;
use crate::normalize::normalize_leases;
use crate::presence::{
    last_seen_for, resolve_dhcp_only, resolve_last_seen, resolve_smart, select_method,
};
use crate::source::DnsSource;
use crate::store_manager::StoreHandle;

const BASE_LOG_LIMIT: u32 = 2_000;
const LOG_LIMIT_PER_TEN_DEVICES: u32 = 200;
const MAX_LOG_LIMIT: u32 = 10_000;

/// Log-fetch entry limit, scaled with the device population.
pub(crate) fn log_fetch_limit(device_count: usize) -> u32 {
    MAX_LOG_LIMIT.min(BASE_LOG_LIMIT + (device_count as u32 / 10) * LOG_LIMIT_PER_TEN_DEVICES)
}

/// Outcome of one successful polling cycle.
#[derive(Debug)]
pub struct CycleSummary {
    pub devices: usize,
    pub method: PresenceMethod,
    pub delta: DeviceSetDelta,
}

pub struct Coordinator {
    source: Arc<dyn DnsSource>,
    store: StoreHandle,
    tracking: TrackingConfig,
    analyzer: ActivityAnalyzer,
    filter: IpFilter,
    /// Normalized MACs from the previous successful poll. Replaced wholesale
    /// after each committed cycle; a failed cycle leaves it untouched.
    prior: HashSet<String>,
}

impl Coordinator {
    /// `prior` seeds the device-set snapshot, normally from the store's
    /// `present` flags, so a daemon restart does not report every known
    /// device as new.
    pub fn new(
        source: Arc<dyn DnsSource>,
        store: StoreHandle,
        tracking: TrackingConfig,
        prior: HashSet<String>,
    ) -> Self {
        let analyzer = ActivityAnalyzer::new(
            tracking.activity_score_threshold,
            tracking.analysis_window_minutes,
        );
        let filter = IpFilter::new(tracking.ip_filter_mode, &tracking.ip_ranges);
        Self {
            source,
            store,
            tracking,
            analyzer,
            filter,
            prior,
        }
    }

    /// Periodic polling loop. At most one cycle is in flight at a time; a
    /// tick that arrives while a cycle is still running is skipped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.tracking.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(summary) => {
                            debug!(
                                devices = summary.devices,
                                method = %summary.method,
                                "polling cycle committed"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "polling cycle failed, keeping previous device state");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Reconciliation coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// One polling cycle: fetch, normalize, resolve presence, diff, commit.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, CycleError> {
        let raw_leases = self.source.fetch_leases().await?;
        let (leases, stats) = normalize_leases(raw_leases, &self.filter);
        let now = Utc::now();

        let (method, records): (PresenceMethod, Vec<PresenceRecord>) =
            if !self.tracking.log_tracking {
                let records = leases.iter().map(|l| resolve_dhcp_only(l, now)).collect();
                (PresenceMethod::DhcpOnly, records)
            } else {
                let capability = self.source.probe_log_capability().await;
                if !capability.available {
                    warn!(
                        message = %capability.message,
                        "query log source unavailable, degrading to lease presence only"
                    );
                    let records = leases.iter().map(|l| resolve_dhcp_only(l, now)).collect();
                    (PresenceMethod::DhcpOnly, records)
                } else {
                    let entries = self.fetch_log_window(leases.len(), now).await?;
                    let method = select_method(
                        true,
                        self.tracking.smart_activity,
                        true,
                        !entries.is_empty(),
                    );
                    let records = self.resolve_all(method, &leases, &entries, now);
                    (method, records)
                }
            };

        let current: HashSet<String> = leases.iter().map(|l| l.mac_address.clone()).collect();
        let mut new: Vec<String> = current.difference(&self.prior).cloned().collect();
        let mut removed: Vec<String> = self.prior.difference(&current).cloned().collect();
        new.sort();
        removed.sort();
        let delta = DeviceSetDelta { new, removed };

        let stale = records.iter().filter(|r| r.is_stale).count();

        self.store
            .commit_cycle(records, delta.clone())
            .await
            .map_err(|e| CycleError::Store(e.to_string()))?;

        // Commit succeeded: replace the retained snapshot.
        self.prior = current;

        info!(
            devices = leases.len(),
            skipped = stats.skipped,
            filtered = stats.filtered,
            stale,
            new = delta.new.len(),
            removed = delta.removed.len(),
            method = %method,
            "polling cycle complete"
        );

        Ok(CycleSummary {
            devices: leases.len(),
            method,
            delta,
        })
    }

    /// Fetch the query-log window covering both the analysis window and the
    /// staleness threshold.
    async fn fetch_log_window(
        &self,
        device_count: usize,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<QueryLogEntry>, CycleError> {
        let window_minutes = self
            .tracking
            .analysis_window_minutes
            .max(self.tracking.stale_threshold_minutes);
        let start = now - Duration::minutes(window_minutes);
        let limit = log_fetch_limit(device_count);

        let raw_entries = self.source.fetch_logs(start, now, limit).await?;
        let fetched = raw_entries.len();

        if fetched as u32 >= limit {
            warn!(
                limit,
                window_minutes,
                "log fetch hit the entry limit; older entries in the window may be missing"
            );
        }

        let entries: Vec<QueryLogEntry> = raw_entries
            .into_iter()
            .filter_map(|raw| raw.into_entry())
            .collect();

        let dropped = fetched - entries.len();
        if dropped > 0 {
            debug!(dropped, "dropped malformed query log entries");
        }

        Ok(entries)
    }

    fn resolve_all(
        &self,
        method: PresenceMethod,
        leases: &[DeviceLease],
        entries: &[QueryLogEntry],
        now: chrono::DateTime<Utc>,
    ) -> Vec<PresenceRecord> {
        match method {
            PresenceMethod::SmartActivity => {
                let ips: Vec<String> = leases.iter().map(|l| l.ip_address.clone()).collect();
                let assessments = self.analyzer.analyze_batch(entries, &ips);

                leases
                    .iter()
                    .map(|lease| {
                        // A device whose analysis produced no result gets a
                        // zero-assessment with an explanatory note instead of
                        // failing the batch.
                        let assessment =
                            assessments.get(&lease.ip_address).cloned().unwrap_or_else(|| {
                                ActivityAssessment::inactive(format!(
                                    "Analysis error: no result for {}",
                                    lease.ip_address
                                ))
                            });
                        let last_seen = last_seen_for(&lease.ip_address, entries);
                        resolve_smart(lease, assessment, last_seen, now)
                    })
                    .collect()
            }
            PresenceMethod::LastSeen => leases
                .iter()
                .map(|lease| {
                    resolve_last_seen(
                        lease,
                        last_seen_for(&lease.ip_address, entries),
                        now,
                        self.tracking.stale_threshold_minutes,
                    )
                })
                .collect(),
            PresenceMethod::DhcpOnly => {
                leases.iter().map(|l| resolve_dhcp_only(l, now)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::watch;

    use crate::config::FilterMode;
    use crate::error::SourceError;
    use crate::source::types::{LogCapability, RawLease, RawLogEntry, RawQuestion};
    use crate::store::db::StoreDb;
    use shared::types::NEVER_SEEN_MINUTES;

    struct MockSource {
        leases: Mutex<Vec<RawLease>>,
        fail_leases: Mutex<bool>,
        available: Mutex<bool>,
        entries: Mutex<Vec<RawLogEntry>>,
    }

    impl MockSource {
        fn new(leases: Vec<RawLease>) -> Arc<Self> {
            Arc::new(Self {
                leases: Mutex::new(leases),
                fail_leases: Mutex::new(false),
                available: Mutex::new(true),
                entries: Mutex::new(Vec::new()),
            })
        }

        fn set_leases(&self, leases: Vec<RawLease>) {
            *self.leases.lock().unwrap() = leases;
        }

        fn set_fail_leases(&self, fail: bool) {
            *self.fail_leases.lock().unwrap() = fail;
        }

        fn set_available(&self, available: bool) {
            *self.available.lock().unwrap() = available;
        }

        fn set_entries(&self, entries: Vec<RawLogEntry>) {
            *self.entries.lock().unwrap() = entries;
        }
    }

    #[async_trait]
    impl DnsSource for MockSource {
        async fn fetch_leases(&self) -> Result<Vec<RawLease>, SourceError> {
            if *self.fail_leases.lock().unwrap() {
                return Err(SourceError::Status("error".to_string()));
            }
            Ok(self.leases.lock().unwrap().clone())
        }

        async fn probe_log_capability(&self) -> LogCapability {
            let available = *self.available.lock().unwrap();
            LogCapability {
                available,
                message: if available {
                    "ok".to_string()
                } else {
                    "query logging disabled".to_string()
                },
            }
        }

        async fn fetch_logs(
            &self,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<RawLogEntry>, SourceError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    fn raw_lease(ip: &str, mac: &str) -> RawLease {
        RawLease {
            address: Some(ip.to_string()),
            hardware_address: Some(mac.to_string()),
            host_name: Some("device".to_string()),
            ..Default::default()
        }
    }

    fn raw_entry(ip: &str, minutes_ago: i64, domain: &str) -> RawLogEntry {
        RawLogEntry {
            client_ip_address: Some(ip.to_string()),
            timestamp: Some(
                (Utc::now() - Duration::minutes(minutes_ago))
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            protocol: Some("TCP".to_string()),
            question: Some(RawQuestion {
                name: Some(domain.to_string()),
                record_type: Some("A".to_string()),
            }),
        }
    }

    fn tracking(log_tracking: bool, smart: bool) -> TrackingConfig {
        TrackingConfig {
            log_tracking,
            smart_activity: smart,
            ip_filter_mode: FilterMode::Disabled,
            ..Default::default()
        }
    }

    fn store_handle() -> StoreHandle {
        let db = StoreDb::open(":memory:").unwrap();
        let (hash_tx, _hash_rx) = watch::channel(String::new());
        StoreHandle::spawn(db, hash_tx)
    }

    #[tokio::test]
    async fn identical_polls_yield_empty_second_delta() {
        let source = MockSource::new(vec![
            raw_lease("192.168.1.10", "aabbccddee01"),
            raw_lease("192.168.1.11", "aabbccddee02"),
        ]);
        let mut coordinator = Coordinator::new(
            source.clone(),
            store_handle(),
            tracking(false, false),
            HashSet::new(),
        );

        let first = coordinator.run_cycle().await.unwrap();
        assert_eq!(first.delta.new.len(), 2);
        assert!(first.delta.removed.is_empty());

        let second = coordinator.run_cycle().await.unwrap();
        assert!(second.delta.is_empty());
    }

    #[tokio::test]
    async fn vanished_device_is_reported_but_not_deleted() {
        let store = store_handle();
        let source = MockSource::new(vec![
            raw_lease("192.168.1.10", "aabbccddee01"),
            raw_lease("192.168.1.11", "aabbccddee02"),
        ]);
        let mut coordinator = Coordinator::new(
            source.clone(),
            store.clone(),
            tracking(false, false),
            HashSet::new(),
        );
        coordinator.run_cycle().await.unwrap();

        source.set_leases(vec![raw_lease("192.168.1.10", "aabbccddee01")]);
        let summary = coordinator.run_cycle().await.unwrap();
        assert_eq!(summary.delta.removed, vec!["AA:BB:CC:DD:EE:02".to_string()]);

        // The record survives with its present flag cleared.
        let record = store
            .get_one("AA:BB:CC:DD:EE:02".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(!record.present);
    }

    #[tokio::test]
    async fn probe_unavailable_degrades_to_dhcp_only() {
        let store = store_handle();
        let source = MockSource::new(vec![raw_lease("192.168.1.10", "aabbccddee01")]);
        source.set_available(false);

        let mut coordinator =
            Coordinator::new(source, store.clone(), tracking(true, true), HashSet::new());
        let summary = coordinator.run_cycle().await.unwrap();
        assert_eq!(summary.method, PresenceMethod::DhcpOnly);

        let records = store.get_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_stale);
        assert_eq!(records[0].method, PresenceMethod::DhcpOnly);
    }

    #[tokio::test]
    async fn smart_cycle_marks_quiet_device_stale_with_sentinel() {
        let store = store_handle();
        let source = MockSource::new(vec![
            raw_lease("192.168.1.10", "aabbccddee01"),
            raw_lease("192.168.1.11", "aabbccddee02"),
        ]);
        // Log entries only for the first device.
        source.set_entries(vec![
            raw_entry("192.168.1.10", 2, "news.example.com"),
            raw_entry("192.168.1.10", 4, "mail.example.org"),
            raw_entry("192.168.1.10", 9, "shop.example.net"),
        ]);

        let mut coordinator =
            Coordinator::new(source, store.clone(), tracking(true, true), HashSet::new());
        let summary = coordinator.run_cycle().await.unwrap();
        assert_eq!(summary.method, PresenceMethod::SmartActivity);

        let quiet = store
            .get_one("AA:BB:CC:DD:EE:02".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(quiet.is_stale);
        assert_eq!(quiet.minutes_since_seen, NEVER_SEEN_MINUTES);
        let assessment = quiet.assessment.unwrap();
        assert_eq!(assessment.activity_score, 0.0);

        let busy = store
            .get_one("AA:BB:CC:DD:EE:01".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(busy.last_seen.is_some());
        assert!(busy.assessment.unwrap().total_queries > 0);
    }

    #[tokio::test]
    async fn empty_log_fetch_falls_back_to_last_seen() {
        let store = store_handle();
        let source = MockSource::new(vec![raw_lease("192.168.1.10", "aabbccddee01")]);
        // probe available but no entries at all

        let mut coordinator =
            Coordinator::new(source, store.clone(), tracking(true, true), HashSet::new());
        let summary = coordinator.run_cycle().await.unwrap();
        assert_eq!(summary.method, PresenceMethod::LastSeen);

        let record = store
            .get_one("AA:BB:CC:DD:EE:01".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_stale);
        assert_eq!(record.minutes_since_seen, NEVER_SEEN_MINUTES);
        assert!(record.assessment.is_none());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_prior_state_and_snapshot() {
        let store = store_handle();
        let source = MockSource::new(vec![raw_lease("192.168.1.10", "aabbccddee01")]);
        let mut coordinator = Coordinator::new(
            source.clone(),
            store.clone(),
            tracking(false, false),
            HashSet::new(),
        );
        coordinator.run_cycle().await.unwrap();

        source.set_fail_leases(true);
        assert!(coordinator.run_cycle().await.is_err());

        // Prior state untouched: the device is still present.
        let record = store
            .get_one("AA:BB:CC:DD:EE:01".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(record.present);

        // Snapshot untouched: recovering with the same lease list reports no
        // membership change.
        source.set_fail_leases(false);
        let summary = coordinator.run_cycle().await.unwrap();
        assert!(summary.delta.is_empty());
    }

    #[tokio::test]
    async fn restart_snapshot_suppresses_rediscovery() {
        let store = store_handle();
        let source = MockSource::new(vec![raw_lease("192.168.1.10", "aabbccddee01")]);
        let prior: HashSet<String> = ["AA:BB:CC:DD:EE:01".to_string()].into_iter().collect();

        let mut coordinator = Coordinator::new(source, store, tracking(false, false), prior);
        let summary = coordinator.run_cycle().await.unwrap();
        assert!(summary.delta.is_empty());
    }

    #[test]
    fn log_limit_scales_with_device_count() {
        assert_eq!(log_fetch_limit(0), 2_000);
        assert_eq!(log_fetch_limit(9), 2_000);
        assert_eq!(log_fetch_limit(10), 2_200);
        assert_eq!(log_fetch_limit(95), 3_800);
        assert_eq!(log_fetch_limit(400), 10_000);
        assert_eq!(log_fetch_limit(5_000), 10_000);
    }
}
