//! Thin wrapper around `slog` so that downstream crates depend on a single
//! logging surface. Components receive a `Logger` at construction and derive
//! child loggers with `log.new(o!(...))`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger. Intended for executable entry points;
/// libraries should accept a `Logger` instead.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging config must be valid")
}

/// Builds a logger from a `sloggers` TOML configuration string.
pub fn from_toml(config: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// A logger that swallows all records. Used as the fallback when a component
/// is constructed without a logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

lazy_static::lazy_static! {
    static ref GLOBAL: Logger = discard();
}

/// Process-wide fallback logger for contexts that cannot thread a `Logger`
/// through (drop impls, detached tasks).
pub fn global() -> &'static Logger {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let logger = from_toml(DEFAULT_CONFIG).unwrap();

        info!(logger, "logger built"; "context" => "test");
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(from_toml("type = \"no-such-sink\"").is_err());
    }

    #[test]
    fn test_discard() {
        let logger = discard();

        debug!(logger, "swallowed");
    }
}
