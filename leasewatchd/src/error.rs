use thiserror::Error;

/// Failures talking to the DNS server.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level failure (connect, timeout, body decode).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered but the envelope status was not "ok".
    #[error("API returned status {0:?}")]
    Status(String),
}

/// Failures that abort an entire polling cycle. Prior device state is
/// retained unchanged whenever one of these is raised.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("store commit failed: {0}")]
    Store(String),
}
