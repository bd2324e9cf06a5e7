//! Logging initialization.
//!
//! Controlled by two environment variables:
//! - `QUIRE_LOG`: an [`EnvFilter`] directive (default `info`).
//! - `QUIRE_LOG_FORMAT`: `json` for JSON events on stderr, anything else
//!   (or unset) for the human-readable formatter.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job.

use tracing_subscriber::EnvFilter;

/// Env var holding the filter directive.
pub const LOG_ENV: &str = "QUIRE_LOG";

/// Env var selecting the output format.
pub const LOG_FORMAT_ENV: &str = "QUIRE_LOG_FORMAT";

/// Output format for [`init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Human,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Read the format from `QUIRE_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV).as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Human,
        }
    }
}

/// Install the global subscriber. Calling it twice is harmless: the second
/// installation attempt is ignored.
pub fn init(format: LogFormat) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "subscriber already installed");
    }
}
