//! Structured logging with `tracing`.
//!
//! Lifecycle transitions across the orchestrator are logged with
//! `session_id`, `conversation_id` and `call_id` fields so a single
//! conversation can be followed through the output. [`init_logging`] wires
//! up the process-wide subscriber in the configured [`LogFormat`];
//! [`test_utils::capture_logs`] records events in memory for assertions.

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Line format of the process-wide subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line records.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Initialize the global subscriber in `format`, filtering at `level`.
pub fn init_logging(level: &str, format: LogFormat) {
    match format {
        LogFormat::Compact => init_subscriber(level),
        LogFormat::Json => init_json_subscriber(level),
    }
}

/// Initialize the global tracing subscriber with stderr output.
///
/// `RUST_LOG` takes precedence over `level` when set. Subsequent calls are
/// no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init fails if a global subscriber is already installed
    let _ = subscriber.try_init();
}

/// Like [`init_subscriber`] but emits one JSON object per line.
pub fn init_json_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_subscriber_is_idempotent() {
        init_subscriber("warn");
        init_subscriber("debug");
        init_json_subscriber("info");
        init_logging("info", LogFormat::Json);
    }

    #[test]
    fn compact_is_the_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
