//! `tracing` subscriber setup.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Build the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| LoggingError::InvalidFilter { filter: config.level.clone(), message: e.to_string() })
}

/// Install the global subscriber writing to stdout.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), LoggingError> {
    init_tracing_with_writer(config, std::io::stdout)
}

/// Install the global subscriber writing to `writer`.
pub fn init_tracing_with_writer<W>(config: &LoggingConfig, writer: W) -> Result<(), LoggingError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_target(true);
    let installed = match config.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)?;
    tracing::debug!(level = %config.level, format = ?config.format, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig { level: "resilience=verbose".into(), ..LoggingConfig::default() };
        assert!(matches!(env_filter(&config), Err(LoggingError::InvalidFilter { .. })));
    }
}
