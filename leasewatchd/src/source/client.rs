use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::SourceError;
use crate::source::types::{
    ApiEnvelope, DhcpLeasesResponse, LogCapability, QueryLogsResponse, RawLease, RawLogEntry,
};

/// The DNS server boundary consumed by the coordinator.
///
/// One attempt per call; retry policy belongs to the caller's cycle
/// semantics, not here.
#[async_trait]
pub trait DnsSource: Send + Sync {
    /// Fetch the current DHCP lease table. A non-ok envelope status is an
    /// error: the whole polling cycle fails on it.
    async fn fetch_leases(&self) -> Result<Vec<RawLease>, SourceError>;

    /// Check whether the query-log API is usable. Safe to call every cycle;
    /// transport failures surface as `available = false`, never as an error.
    async fn probe_log_capability(&self) -> LogCapability;

    /// Fetch up to `limit` query log entries between `start` and `end`.
    async fn fetch_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RawLogEntry>, SourceError>;
}

/// HTTP client for a Technitium-style DNS server (token-authenticated JSON
/// API with `{status, response}` envelopes).
pub struct TechnitiumClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TechnitiumClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl DnsSource for TechnitiumClient {
    async fn fetch_leases(&self) -> Result<Vec<RawLease>, SourceError> {
        let envelope: ApiEnvelope<DhcpLeasesResponse> = self
            .http
            .get(self.endpoint("/api/dhcp/leases/list"))
            .query(&[("token", self.token.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if envelope.status != "ok" {
            return Err(SourceError::Status(envelope.status));
        }

        Ok(envelope.response.map(|r| r.leases).unwrap_or_default())
    }

    async fn probe_log_capability(&self) -> LogCapability {
        let end = Utc::now();
        let start = end - chrono::Duration::hours(1);

        match self.fetch_logs(start, end, 5).await {
            Ok(_) => LogCapability {
                available: true,
                message: "query log API reachable".to_string(),
            },
            Err(e) => LogCapability {
                available: false,
                message: e.to_string(),
            },
        }
    }

    async fn fetch_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RawLogEntry>, SourceError> {
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let limit = limit.to_string();

        let envelope: ApiEnvelope<QueryLogsResponse> = self
            .http
            .get(self.endpoint("/api/logs/query"))
            .query(&[
                ("token", self.token.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("entriesPerPage", limit.as_str()),
                ("pageNumber", "1"),
                ("descendingOrder", "true"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if envelope.status != "ok" {
            return Err(SourceError::Status(envelope.status));
        }

        Ok(envelope.response.map(|r| r.entries).unwrap_or_default())
    }
}
