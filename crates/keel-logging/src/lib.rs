//! Structured logging for Keel
//!
//! Sets up a `tracing` subscriber with console and rolling file output.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Pretty Output**: Human-readable console format for development
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use keel_logging::{KeelSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! let _guard = KeelSubscriberBuilder::new().init()?;
//!
//! // Development mode with pretty human-readable output
//! let _guard = KeelSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```
//!
//! Keep the returned guard alive for as long as file output is needed;
//! dropping it flushes the background writer.

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// A type-erased layer over the base registry
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create log file appender: {0}")]
    Appender(#[from] InitError),

    #[error("Failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Builder for configuring and initializing the Keel logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
#[derive(Debug, Clone, Default)]
pub struct KeelSubscriberBuilder {
    config: LogConfig,
}

impl KeelSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Switch the console between pretty and JSONL output
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self.config.console.ansi = pretty;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// The configuration the subscriber will be built from
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.filter_directives()))
    }

    fn console_layer(&self) -> BoxedLayer {
        let jsonl = &self.config.jsonl;
        if self.config.console.pretty {
            tracing_subscriber::fmt::layer()
                .with_ansi(self.config.console.ansi)
                .with_target(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .boxed()
        }
    }

    fn file_layer(&self, file: &FileConfig) -> Result<(BoxedLayer, WorkerGuard), LoggingError> {
        std::fs::create_dir_all(&file.directory)?;

        let rotation = match file.rotation {
            RotationStrategy::Daily => Rotation::DAILY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Never => Rotation::NEVER,
        };
        let mut builder = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(&file.prefix)
            .filename_suffix("log");
        if let Some(max) = file.max_files.filter(|_| file.rotation != RotationStrategy::Never) {
            builder = builder.max_log_files(max);
        }
        let appender = builder.build(&file.directory)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let jsonl = &self.config.jsonl;
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(jsonl.include_spans)
            .flatten_event(jsonl.flatten_events)
            .with_file(jsonl.include_location)
            .with_line_number(jsonl.include_location)
            .with_writer(writer)
            .boxed();
        Ok((layer, guard))
    }

    /// Build the layers without installing them
    ///
    /// The filter is included, so the result can be attached to a
    /// `Registry` directly.
    pub fn build(&self) -> Result<(Vec<BoxedLayer>, Option<WorkerGuard>), LoggingError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(self.console_layer());
        }
        if let Some(file) = &self.config.file {
            let (layer, file_guard) = self.file_layer(file)?;
            layers.push(layer);
            guard = Some(file_guard);
        }
        layers.push(self.env_filter().boxed());

        Ok((layers, guard))
    }

    /// Install the subscriber globally
    ///
    /// Returns the file writer guard when file output is configured.
    ///
    /// # Errors
    ///
    /// Fails if the log directory cannot be created or a global subscriber
    /// is already set.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (layers, guard) = self.build()?;
        Registry::default().with(layers).try_init()?;
        Ok(guard)
    }
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_testing() {
    let _ = KeelSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}
