//! Logging initialization.
//!
//! Thin wrappers over the observability package so binaries do not have
//! to build a `LogConfig` by hand.

/// Initialize logging for the delivery worker.
///
/// Writes JSONL to the central log file and mirrors to stderr. The level
/// is used only when `RUST_LOG` is not set.
pub fn init_logging(level: &str) {
    init_logging_for_service("courier", level);
}

/// Initialize logging with a custom service name.
pub fn init_logging_for_service(service_name: &str, level: &str) {
    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        also_stderr: true,
        ..Default::default()
    });
}
