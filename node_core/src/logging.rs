//! Logger construction. Every subsystem receives a child [`slog::Logger`] derived from the one
//! built here rather than reaching for a global, so tests can run many nodes in one process
//! without their log lines getting tangled together.

use sloggers::Config;

const DEFAULT_CONFIG_TOML: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root logger from a TOML `sloggers::LoggerConfig` document, falling back to a
/// plain stderr terminal logger at `info` level when `toml` is empty.
pub fn build_logger(toml: &str) -> crate::error::Result<slog::Logger> {
    let toml = if toml.trim().is_empty() { DEFAULT_CONFIG_TOML } else { toml };

    let config: sloggers::LoggerConfig = serdeconv::from_toml_str(toml)
        .map_err(|e| crate::error::NodeError::with_detail(crate::error::ErrorKind::BadArgument, format!("invalid logger config: {}", e)))?;

    config
        .build_logger()
        .map_err(|e| crate::error::NodeError::with_detail(crate::error::ErrorKind::InternalInvariant, format!("failed to build logger: {}", e)))
}

pub fn default_logger() -> slog::Logger {
    build_logger(DEFAULT_CONFIG_TOML).expect("the default logger config is always valid")
}
