use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "warn,sitefix=info,sitefix_core=info";

/// Log to stderr so reports on stdout stay clean. `RUST_LOG` overrides the
/// default filter.
pub fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize logging: {error}"))
}
