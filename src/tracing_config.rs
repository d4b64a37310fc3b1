//! Tracing configuration for the service binary
//!
//! The library only emits `log`/`tracing` events; the binary decides where they go.
//! `log` records are bridged into the subscriber, so backend logs share the request spans.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Configuration for tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable console output with colors
    Console,
    /// Compact console output without colors, for CI and log collectors
    Compact,
    /// JSON structured logging
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Tracing configuration builder
#[derive(Debug)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Explicit filter directive, takes precedence over `RUST_LOG` and verbosity
    pub env_filter: Option<String>,
    /// Identifier of this service instance, logged once at startup
    pub instance_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            env_filter: None,
            instance_id: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-2+)
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_instance_id<S: Into<String>>(mut self, instance_id: S) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Convert verbosity level to tracing filter string
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    fn build_filter(&self) -> anyhow::Result<EnvFilter> {
        if let Some(directive) = &self.env_filter {
            return Ok(EnvFilter::try_new(directive)?);
        }
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return Ok(EnvFilter::try_from_default_env()?);
        }
        Ok(EnvFilter::try_new(self.verbosity_to_filter())?)
    }

    /// Install the global subscriber
    ///
    /// # Errors
    /// - Invalid filter directive
    /// - A global subscriber is already installed
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let registry = Registry::default().with(self.build_filter()?);

        match self.format {
            TracingFormat::Console => {
                let fmt_layer = fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            TracingFormat::Compact => {
                let fmt_layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(fmt_layer).try_init()?;
            },
        }

        if let Some(instance_id) = &self.instance_id {
            tracing::info!(instance_id = %instance_id, "Logging initialized");
        }

        Ok(())
    }
}

/// Initialize tracing with service defaults
///
/// # Errors
/// - See [`TracingConfig::init`]
pub fn init_service_tracing(verbosity: u8, format: TracingFormat) -> anyhow::Result<()> {
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .with_instance_id(uuid::Uuid::new_v4().to_string())
        .init()
}
