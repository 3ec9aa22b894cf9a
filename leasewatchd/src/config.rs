use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ipfilter;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the DNS server, e.g. "http://192.168.1.2:5380".
    pub base_url: String,
    /// API token for the DNS server.
    pub token: String,
}

/// How an IP address should be matched against the configured ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Disabled,
    Include,
    Exclude,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Whether DNS query logs are consulted at all.
    #[serde(default)]
    pub log_tracking: bool,

    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: i64,

    #[serde(default = "default_smart_activity")]
    pub smart_activity: bool,

    /// Composite score at or above which a device counts as actively used.
    #[serde(default = "default_score_threshold")]
    pub activity_score_threshold: f64,

    #[serde(default = "default_analysis_window")]
    pub analysis_window_minutes: i64,

    #[serde(default = "default_filter_mode")]
    pub ip_filter_mode: FilterMode,

    /// Comma/semicolon/newline-separated IPs, CIDR blocks and start-end
    /// ranges. Ignored when ip_filter_mode is "disabled".
    #[serde(default)]
    pub ip_ranges: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_stale_threshold() -> i64 {
    60
}

fn default_smart_activity() -> bool {
    true
}

fn default_score_threshold() -> f64 {
    25.0
}

fn default_analysis_window() -> i64 {
    30
}

fn default_filter_mode() -> FilterMode {
    FilterMode::Disabled
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/leasewatch/devices.db")
}

fn default_listen() -> String {
    "[::]:8093".to_string()
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_tracking: false,
            stale_threshold_minutes: default_stale_threshold(),
            smart_activity: default_smart_activity(),
            activity_score_threshold: default_score_threshold(),
            analysis_window_minutes: default_analysis_window(),
            ip_filter_mode: default_filter_mode(),
            ip_ranges: String::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tracking;
        if !(30..=600).contains(&t.poll_interval_secs) {
            bail!(
                "poll_interval_secs must be between 30 and 600, got {}",
                t.poll_interval_secs
            );
        }
        if !(0.0..=100.0).contains(&t.activity_score_threshold) {
            bail!(
                "activity_score_threshold must be between 0 and 100, got {}",
                t.activity_score_threshold
            );
        }
        if t.analysis_window_minutes < 1 {
            bail!(
                "analysis_window_minutes must be at least 1, got {}",
                t.analysis_window_minutes
            );
        }
        if t.stale_threshold_minutes < 1 {
            bail!(
                "stale_threshold_minutes must be at least 1, got {}",
                t.stale_threshold_minutes
            );
        }
        if t.ip_filter_mode != FilterMode::Disabled {
            ipfilter::validate_ranges(&t.ip_ranges)
                .context("Invalid ip_ranges configuration")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse(
            r#"
            [server]
            base_url = "http://dns.local:5380"
            token = "secret"
            "#,
        );
        assert_eq!(config.tracking.poll_interval_secs, 60);
        assert_eq!(config.tracking.stale_threshold_minutes, 60);
        assert!(config.tracking.smart_activity);
        assert!(!config.tracking.log_tracking);
        assert_eq!(config.tracking.activity_score_threshold, 25.0);
        assert_eq!(config.tracking.ip_filter_mode, FilterMode::Disabled);
        assert_eq!(config.api.listen, "[::]:8093");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_poll_interval() {
        let config = parse(
            r#"
            [server]
            base_url = "http://dns.local:5380"
            token = "secret"

            [tracking]
            poll_interval_secs = 5
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_ip_ranges_when_filtering_enabled() {
        let config = parse(
            r#"
            [server]
            base_url = "http://dns.local:5380"
            token = "secret"

            [tracking]
            ip_filter_mode = "include"
            ip_ranges = "not-an-ip"
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn filter_mode_parses_lowercase() {
        let config = parse(
            r#"
            [server]
            base_url = "http://dns.local:5380"
            token = "secret"

            [tracking]
            ip_filter_mode = "exclude"
            ip_ranges = "192.168.1.0/28"
            "#,
        );
        assert_eq!(config.tracking.ip_filter_mode, FilterMode::Exclude);
        config.validate().unwrap();
    }
}
