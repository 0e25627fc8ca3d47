//! Tracing initialisation.
//!
//! Sets up a `tracing-subscriber` registry with one formatting layer:
//! - pretty (colored, multi-line) for the bench
//! - compact (single line, no colors) for long runs
//! - JSON for log aggregation
//!
//! `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//! ```no_run
//! use rust_seq::logging;
//! use seq_core::config::InstrumentConfig;
//!
//! let config = InstrumentConfig::load_from("config/instrument.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!("instrument starting");
//! # Ok::<(), seq_core::SeqError>(())
//! ```

use seq_core::config::{InstrumentConfig, LogFormat};
use seq_core::error::{SeqError, SeqResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Log span NEW and CLOSE events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    pub with_thread_names: bool,
    /// Colors (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section.
    pub fn from_config(config: &InstrumentConfig) -> SeqResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            with_span_events: config.logging.span_events,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

pub fn init_from_config(config: &InstrumentConfig) -> SeqResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`,
/// so tests and the CLI can both call it.
pub fn init(config: TracingConfig) -> SeqResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already installed by an earlier call.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(SeqError::Configuration(format!(
            "failed to initialise tracing: {}",
            e
        ))),
    }
}

fn parse_log_level(level: &str) -> SeqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(SeqError::Configuration(format!(
            "invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(SeqError::Configuration(_))
        ));
    }

    #[test]
    fn tracing_config_follows_logging_section() {
        let mut config = InstrumentConfig::default();
        config.logging.level = "debug".into();
        config.logging.format = LogFormat::Json;
        config.logging.span_events = true;

        let tracing = TracingConfig::from_config(&config).unwrap();
        assert_eq!(tracing.level, Level::DEBUG);
        assert_eq!(tracing.format, LogFormat::Json);
        assert!(tracing.with_span_events);
    }

    #[test]
    fn init_twice_is_fine() {
        let config = TracingConfig::new(Level::WARN).with_format(LogFormat::Compact);
        init(config.clone()).unwrap();
        init(config).unwrap();
    }
}
