//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`, with the AMQP client
//! quietened to `warn`). Output is JSON unless `ESHOP_LOG_FORMAT=compact`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,lapin=warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for log shipping.
    #[default]
    Json,
    /// Human-readable single-line output, for local runs.
    Compact,
}

impl LogFormat {
    /// Read `ESHOP_LOG_FORMAT`; unknown or missing values mean JSON.
    pub fn from_env() -> Self {
        std::env::var("ESHOP_LOG_FORMAT")
            .ok()
            .and_then(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" | "text" | "pretty" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(true)
            .try_init()
            .is_ok(),
    }
}
