use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chat_core=debug,redis=warn"));

    fmt().with_env_filter(env_filter).with_target(false).init();
}

/// JSON-formatted output for log shipping
pub fn init_json_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,redis=warn"));

    fmt()
        .json()
        .with_env_filter(env_filter)
        .with_current_span(false)
        .init();
}

/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}
