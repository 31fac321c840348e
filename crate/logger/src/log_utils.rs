use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Install the global tracing subscriber, once per process.
///
/// The filter comes from `RUST_LOG` when it is set and parses, otherwise from
/// `default_value` (for instance `"info"` or `"cryptoki_mgmt_hsm=debug"`).
/// Later calls do nothing, so every test may call it.
pub fn log_init(default_value: &str) {
    LOG_INIT.call_once(|| tracing_setup(default_value));
}

fn tracing_setup(default_value: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_value));

    // another subscriber may already be installed, e.g. by a test harness
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
    {
        eprintln!("tracing was not initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::log_init;

    #[test]
    fn log_init_is_idempotent() {
        log_init("debug");
        log_init("info");
        tracing::debug!("logging initialized twice without panicking");
    }
}
