use std::sync::Once;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "callkit_core=debug";

/// Initialize tracing/logging. Call once from the host before using the controller.
/// Subsequent calls are ignored.
pub fn init_logging(default_filter: Option<&str>) {
    static INIT: Once = Once::new();
    let fallback = default_filter.unwrap_or(DEFAULT_FILTER).to_string();
    INIT.call_once(move || {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}
