//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem. The pool logs
//! allocations at `trace`, driver calls and ladder escalations at `debug`,
//! and out-of-memory dumps at `error`.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,hippool=trace")
//! - `HIPPOOL_LOG_LEVEL`: Simple severity knob (error, warn, info, debug, trace)
//! - `HIPPOOL_LOG_FORMAT`: "json" (or "structured") for machine-readable
//!   output; anything else is human-readable console output

use std::str::FromStr;

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for the severity knob
const LOG_LEVEL_ENV: &str = "HIPPOOL_LOG_LEVEL";

/// Environment variable for the output format switch
const LOG_FORMAT_ENV: &str = "HIPPOOL_LOG_FORMAT";

/// Initialize logging from environment variables.
///
/// A full `RUST_LOG` filter wins when set and valid; `HIPPOOL_LOG_LEVEL`
/// is the simple fallback for users who only want a severity, defaulting
/// to `info`. `HIPPOOL_LOG_FORMAT=json` switches the output to structured
/// JSON.
///
/// This function is idempotent - calling it multiple times will only
/// initialize the subscriber once.
pub fn init_logging_from_env() {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = env_filter();
        if json_output() {
            let layer = fmt::layer().json().with_target(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        } else {
            let layer = fmt::layer().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    });
}

/// Build the subscriber filter from the environment.
fn env_filter() -> EnvFilter {
    if let Some(filter) = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
    {
        return filter;
    }
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(tracing::Level::INFO);
    EnvFilter::new(level.to_string())
}

/// Severity parsing is `tracing::Level`'s own (case-insensitive names and
/// the 1-5 shorthand); an unparsable value falls back to the default
/// rather than failing init.
fn parse_level(raw: &str) -> Option<tracing::Level> {
    tracing::Level::from_str(raw.trim()).ok()
}

/// Whether the format switch asks for structured output.
fn json_output() -> bool {
    match std::env::var(LOG_FORMAT_ENV) {
        Ok(raw) => {
            let raw = raw.trim();
            raw.eq_ignore_ascii_case("json") || raw.eq_ignore_ascii_case("structured")
        }
        Err(_) => false,
    }
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
