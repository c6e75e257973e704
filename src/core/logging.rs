//! Tracing subscriber bootstrap.
//!
//! Library code only emits `tracing` events; binaries and tests call one of
//! these to get them printed.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Environment variable consulted by [`init_from_env`].
pub const LOG_ENV_VAR: &str = "CONVOY_LOG";

/// Install a fmt subscriber at the given level (e.g. `"info"`, `"convoy=debug"`).
///
/// Safe to call more than once; an already installed global subscriber wins.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

/// Install a fmt subscriber using `CONVOY_LOG`, falling back to `RUST_LOG`, then `info`.
pub fn init_from_env() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

fn install(filter: EnvFilter) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging("debug");
        init_logging("not a [valid filter");
        init_from_env();
        tracing::info!("logging initialized twice without panicking");
    }
}
