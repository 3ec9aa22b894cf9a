//! Genuine-use scoring over DNS query patterns.
//!
//! Distinguishes a device someone is actually using from one that merely
//! emits automated background traffic (telemetry, update checks, NTP, CDN
//! plumbing). Produces a composite 0-100 score from five sub-scores.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use shared::types::{ActivityAssessment, QueryLogEntry, ScoreBreakdown};
use tracing::{debug, info};

/// Domains whose queries are attributable to automated traffic. Matched as
/// substrings of the lowercased question name.
const BACKGROUND_DOMAINS: &[&str] = &[
    // OS and app telemetry
    "telemetry.microsoft.com",
    "vortex.data.microsoft.com",
    "settings-win.data.microsoft.com",
    "events.data.microsoft.com",
    "telemetry.mozilla.org",
    "app-measurement.com",
    "crashlytics.com",
    "metrics.icloud.com",
    "xp.apple.com",
    // connectivity checks and captive-portal probes
    "msftconnecttest.com",
    "connectivitycheck.gstatic.com",
    "connectivity-check.ubuntu.com",
    "captive.apple.com",
    "detectportal.firefox.com",
    "nmcheck.gnome.org",
    // update services
    "windowsupdate.com",
    "update.microsoft.com",
    "swcdn.apple.com",
    "cdn-apple.com",
    "archive.ubuntu.com",
    "security.ubuntu.com",
    "aus5.mozilla.org",
    "update.googleapis.com",
    "dl.google.com",
    "gvt1.com",
    "gvt2.com",
    // time sync
    "time.windows.com",
    "time.apple.com",
    "time.google.com",
    "time.cloudflare.com",
    "ntp.org",
    // certificate plumbing
    "ocsp.",
    "crl.",
    "pki.goog",
    "amazontrust.com",
    "lencr.org",
    // push and cloud messaging
    "push.apple.com",
    "mtalk.google.com",
    "wns.windows.com",
    // CDN infrastructure zones
    "akadns.net",
    "akamaiedge.net",
    "edgekey.net",
    "edgesuite.net",
    "llnwd.net",
    "trafficmanager.net",
    // reverse lookups and service discovery
    "in-addr.arpa",
    "ip6.arpa",
    "_dns-sd.",
    "wpad.",
];

lazy_static! {
    /// Long hex labels are almost always per-install telemetry identifiers.
    static ref HEX_LABEL: Regex = Regex::new(r"[a-f0-9]{16,}\.").unwrap();
    /// Numeric leading labels in the CDN/load-balancer style.
    static ref NUMBERED_LABEL: Regex = Regex::new(r"\d+\.[a-z]+\.\w+$").unwrap();
    /// Version or build labels.
    static ref VERSION_LABEL: Regex = Regex::new(r"v\d+\.|version\d+\.").unwrap();
}

/// Interactive protocols score higher than plain UDP lookups.
fn protocol_weight(protocol: &str) -> f64 {
    match protocol.to_uppercase().as_str() {
        "UDP" => 0.3,
        "TCP" => 1.0,
        "HTTPS" => 1.2,
        "HTTP" => 0.8,
        _ => 0.5,
    }
}

/// Query-type weights; a weight at or below 0.4 marks the query as
/// background (PTR/SOA/TXT traffic is rarely user-driven).
fn query_type_weight(query_type: &str) -> f64 {
    match query_type.to_uppercase().as_str() {
        "A" => 1.0,
        "AAAA" => 0.9,
        "HTTPS" | "SVCB" => 0.9,
        "CNAME" => 0.8,
        "MX" => 0.6,
        "ANY" => 0.5,
        "SRV" => 0.4,
        "NS" | "TXT" => 0.3,
        "PTR" | "SOA" => 0.2,
        _ => 0.5,
    }
}

const BACKGROUND_TYPE_WEIGHT_CUTOFF: f64 = 0.4;

/// Scores a device's DNS query pattern for genuine-use likelihood.
pub struct ActivityAnalyzer {
    score_threshold: f64,
    window_minutes: i64,
}

impl ActivityAnalyzer {
    pub fn new(score_threshold: f64, window_minutes: i64) -> Self {
        Self {
            score_threshold,
            window_minutes,
        }
    }

    /// Analyze the log slice for one device IP.
    pub fn analyze(&self, logs: &[QueryLogEntry], ip: &str) -> ActivityAssessment {
        self.analyze_at(Utc::now(), logs, ip)
    }

    /// Analyze many IPs against one shared log set.
    pub fn analyze_batch(
        &self,
        logs: &[QueryLogEntry],
        ips: &[String],
    ) -> HashMap<String, ActivityAssessment> {
        info!(devices = ips.len(), "running batch activity analysis");

        let mut results = HashMap::with_capacity(ips.len());
        for ip in ips {
            let assessment = self.analyze(logs, ip);
            debug!(
                ip = %ip,
                score = assessment.activity_score,
                active = assessment.is_actively_used,
                summary = %assessment.analysis_summary,
                "device activity"
            );
            results.insert(ip.clone(), assessment);
        }

        let active = results.values().filter(|a| a.is_actively_used).count();
        info!(
            active,
            total = ips.len(),
            "batch activity analysis complete"
        );
        results
    }

    pub(crate) fn analyze_at(
        &self,
        now: DateTime<Utc>,
        logs: &[QueryLogEntry],
        ip: &str,
    ) -> ActivityAssessment {
        let cutoff = now - Duration::minutes(self.window_minutes);
        let device_logs: Vec<&QueryLogEntry> = logs
            .iter()
            .filter(|e| e.client_ip == ip && e.timestamp >= cutoff)
            .collect();

        if device_logs.is_empty() {
            return ActivityAssessment::inactive("No DNS activity found");
        }

        let total_queries = device_logs.len();
        let breakdown = ScoreBreakdown {
            background: background_score(&device_logs),
            protocol: protocol_score(&device_logs),
            diversity: diversity_score(&device_logs),
            frequency: frequency_score(&device_logs),
            timing: timing_score(&device_logs),
        };

        let activity_score = breakdown.background * 0.30
            + breakdown.protocol * 0.25
            + breakdown.diversity * 0.20
            + breakdown.frequency * 0.15
            + breakdown.timing * 0.10;

        let background_queries = device_logs.iter().filter(|e| is_background(e)).count();
        let background_ratio = background_queries as f64 / total_queries as f64;

        let protocol_diversity = device_logs
            .iter()
            .map(|e| e.protocol.as_str())
            .collect::<HashSet<_>>()
            .len();

        let time_span = time_span_minutes(&device_logs);
        let query_rate = total_queries as f64 / time_span.max(1.0);

        let is_actively_used = activity_score >= self.score_threshold;
        let analysis_summary = summarize(
            activity_score,
            total_queries,
            background_ratio,
            protocol_diversity,
        );

        ActivityAssessment {
            activity_score: round1(activity_score),
            is_actively_used,
            total_queries: total_queries as u32,
            background_ratio: round3(background_ratio),
            protocol_diversity: protocol_diversity as u32,
            query_rate: round2(query_rate),
            analysis_summary,
            breakdown: ScoreBreakdown {
                background: round1(breakdown.background),
                protocol: round1(breakdown.protocol),
                diversity: round1(breakdown.diversity),
                frequency: round1(breakdown.frequency),
                timing: round1(breakdown.timing),
            },
        }
    }
}

/// Share of user-attributable (non-background) queries, as a percentage.
fn background_score(device_logs: &[&QueryLogEntry]) -> f64 {
    let total = device_logs.len();
    if total == 0 {
        return 0.0;
    }
    let user = device_logs.iter().filter(|e| !is_background(e)).count();
    (user as f64 / total as f64 * 100.0).min(100.0)
}

/// Average per-entry protocol weight, scaled to 0-100.
fn protocol_score(device_logs: &[&QueryLogEntry]) -> f64 {
    if device_logs.is_empty() {
        return 0.0;
    }
    let sum: f64 = device_logs
        .iter()
        .map(|e| protocol_weight(&e.protocol))
        .sum();
    (sum / device_logs.len() as f64 * 100.0).min(100.0)
}

/// Domain and query-type variety. Interactive use touches many distinct
/// domains; automated traffic hammers a handful.
fn diversity_score(device_logs: &[&QueryLogEntry]) -> f64 {
    if device_logs.is_empty() {
        return 0.0;
    }

    let domains: HashSet<String> = device_logs
        .iter()
        .filter(|e| !e.question_name.is_empty())
        .map(|e| e.question_name.to_lowercase())
        .collect();
    let types: HashSet<&str> = device_logs
        .iter()
        .filter(|e| !e.question_type.is_empty())
        .map(|e| e.question_type.as_str())
        .collect();

    let domain_diversity = (domains.len() as f64 / 10.0).min(1.0);
    let type_diversity = (types.len() as f64 / 5.0).min(1.0);

    ((domain_diversity + type_diversity) / 2.0 * 100.0).min(100.0)
}

/// Query rate against the interactive band of 0.5-5 queries per minute.
/// Near-silent and bursty-automated rates are both penalized.
fn frequency_score(device_logs: &[&QueryLogEntry]) -> f64 {
    if device_logs.is_empty() {
        return 0.0;
    }

    let time_span = time_span_minutes(device_logs);
    let rate = device_logs.len() as f64 / time_span;

    let score = if (0.5..=5.0).contains(&rate) {
        100.0
    } else if rate < 0.5 {
        rate * 200.0
    } else {
        (100.0 - (rate - 5.0) * 10.0).max(10.0)
    };

    score.clamp(0.0, 100.0)
}

/// Inter-arrival regularity. Human activity is irregular; machines are
/// either metronomic (low CV) or bursty (very high CV).
fn timing_score(device_logs: &[&QueryLogEntry]) -> f64 {
    if device_logs.len() < 3 {
        return 50.0;
    }

    let mut timestamps: Vec<DateTime<Utc>> = device_logs.iter().map(|e| e.timestamp).collect();
    timestamps.sort_unstable();

    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
        .collect();

    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let cv = if mean > 0.0 {
        let variance = intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;
        variance.sqrt() / mean
    } else {
        0.0
    };

    let score = if (0.3..=2.0).contains(&cv) {
        100.0
    } else if cv < 0.3 {
        cv * 333.0
    } else {
        (100.0 - (cv - 2.0) * 50.0).max(10.0)
    };

    score.clamp(0.0, 100.0)
}

fn is_background(entry: &QueryLogEntry) -> bool {
    let domain = entry.question_name.to_lowercase();

    if BACKGROUND_DOMAINS.iter().any(|bg| domain.contains(bg)) {
        return true;
    }
    if query_type_weight(&entry.question_type) <= BACKGROUND_TYPE_WEIGHT_CUTOFF {
        return true;
    }
    is_automated_pattern(&domain)
}

fn is_automated_pattern(domain: &str) -> bool {
    HEX_LABEL.is_match(domain) || NUMBERED_LABEL.is_match(domain) || VERSION_LABEL.is_match(domain)
}

/// Span of the observed timestamps in minutes, with a one-minute floor so
/// single bursts don't divide by zero.
fn time_span_minutes(device_logs: &[&QueryLogEntry]) -> f64 {
    let mut iter = device_logs.iter().map(|e| e.timestamp);
    let Some(first) = iter.next() else {
        return 1.0;
    };
    let (min, max) = iter.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
    ((max - min).num_milliseconds() as f64 / 60_000.0).max(1.0)
}

fn summarize(score: f64, queries: usize, bg_ratio: f64, protocols: usize) -> String {
    let activity_level = if score >= 75.0 {
        "High user activity"
    } else if score >= 50.0 {
        "Moderate user activity"
    } else if score >= 25.0 {
        "Low user activity"
    } else {
        "Mostly background traffic"
    };

    format!(
        "{} - {} queries, {:.0}% background, {} protocols",
        activity_level,
        queries,
        bg_ratio * 100.0,
        protocols
    )
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
