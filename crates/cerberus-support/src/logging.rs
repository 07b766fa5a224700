pub use slog::Logger;
pub use slog::{debug, error, info, o, trace, warn};

/// Builds the root logger for the process. `level` follows the usual
/// `trace`/`debug`/`info`/`warn`/`error` names; anything unrecognised falls
/// back to `info`.
pub fn init(level: &str) -> Logger {
    use sloggers::{Config, LoggerConfig};

    let level = match level {
        "trace" | "debug" | "warn" | "error" => level,
        _ => "info",
    };

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("invalid logger config");

    config.build_logger().expect("failed to build logger")
}

/// A logger that discards everything, for tests and standalone unit checks
/// that don't want to wire up a real sink.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
