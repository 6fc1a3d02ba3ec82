//! Tracing setup for the supervisord binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize stdout tracing at the given base level.
///
/// An explicit `RUST_LOG` in the environment wins over `log_level`.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("supervisor={log_level}")));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
