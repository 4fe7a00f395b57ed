//! Tracing init.
//!
//! Level via DEVSANDBOX_LOG_LEVEL (default `devsandbox=info`), JSON output
//! via DEVSANDBOX_LOG_JSON, WARN-and-above only via DEVSANDBOX_QUIET.

use std::env;

use tracing_subscriber::{prelude::*, EnvFilter};

/// Initialize tracing. Call at process startup.
pub fn init_tracing() {
    let level: String = if is_quiet() {
        "devsandbox=warn".to_string()
    } else {
        env::var("DEVSANDBOX_LOG_LEVEL").unwrap_or_else(|_| "devsandbox=info".to_string())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = env::var("DEVSANDBOX_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false);

    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
}

fn is_quiet() -> bool {
    env::var("DEVSANDBOX_QUIET")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
