//! Structured logging setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// The `[log]` section of the service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Base level filter, e.g. "info" or "worker=debug,info"
    pub filter: String,
    /// Extra directives appended after `filter`
    pub directives: Vec<String>,
    pub format: LogFormat,
    /// Emit span open/close events (task runs, provider calls)
    pub span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directives: vec![
                "sqlx=warn".to_string(),
                "hyper=warn".to_string(),
                "reqwest=warn".to_string(),
            ],
            format: LogFormat::Pretty,
            span_events: false,
        }
    }
}

impl TracingConfig {
    /// Apply `RUST_LOG` and `LOG_FORMAT` on top of the configured values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            self.filter = filter;
            self.directives.clear();
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            };
        }
        self
    }

    /// The full filter string handed to [`EnvFilter`].
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.filter.as_str())
            .chain(self.directives.iter().map(String::as_str))
            .filter(|d| !d.trim().is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber.
///
/// Returns false when a subscriber was already installed; later calls are
/// ignored, which lets tests call this freely.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let directives = config.filter_directives();
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_span_events(span_events).with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(filter = %directives, format = ?config.format, "Tracing initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_join() {
        let config = TracingConfig::default();
        assert_eq!(
            config.filter_directives(),
            "info,sqlx=warn,hyper=warn,reqwest=warn"
        );

        let config = TracingConfig {
            filter: "worker=debug".into(),
            directives: vec![" ".into()],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "worker=debug");
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let config: TracingConfig =
            serde_json::from_str(r#"{"format":"json","span_events":true}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(config.filter, "info");
    }
}
