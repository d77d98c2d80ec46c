//! Tracing subscriber bootstrap

use tracing_subscriber::EnvFilter;

/// Filter variable read when `RUST_LOG` is unset
pub const LOG_ENV: &str = "SESSION_RELAY_LOG";

const FALLBACK: &str = "info";

/// Pick the filter directive: `RUST_LOG`, then `SESSION_RELAY_LOG`, then
/// the configured level, then `info`. Blank values are skipped.
pub fn filter_directive(
    rust_log: Option<String>,
    relay_log: Option<String>,
    configured: &str,
) -> String {
    [rust_log, relay_log, Some(configured.to_string())]
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| FALLBACK.to_string())
}

/// Install the global fmt subscriber (logs go to stderr).
pub fn init(configured: &str) {
    let directive = filter_directive(
        std::env::var("RUST_LOG").ok(),
        std::env::var(LOG_ENV).ok(),
        configured,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(FALLBACK));

    // A subscriber may already be installed (tests).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
