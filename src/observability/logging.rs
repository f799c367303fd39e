//! Structured logging for the gateway
//!
//! Every request runs inside a `dispatch` span carrying `request_id` and
//! `task_type`; backend calls and health probes open child spans so a single
//! request can be followed across primary and fallback attempts.
//!
//! Settings come from the environment:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` (default json)
//! - `LOG_SPANS`: `true` to log span open/close events
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG taskgate run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored, no targets
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

// HTTP plumbing is chatty at debug level and says nothing about dispatch
const QUIET_TARGETS: [&str; 5] = ["hyper", "reqwest", "warp", "rustls", "h2"];

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` value; replaces the level-derived filter when set
    pub filter_override: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            filter_override: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self {
            level: env::var("LOG_LEVEL")
                .map(|v| parse_level(&v))
                .unwrap_or(Level::INFO),
            format: env::var("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(LogFormat::Json),
            include_spans: env::var("LOG_SPANS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            filter_override: env::var("RUST_LOG").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Filter directives: the chosen level, with HTTP plumbing held at warn
    pub fn directives(&self) -> String {
        if let Some(custom) = &self.filter_override {
            return custom.clone();
        }
        let mut directives = vec![self.level.to_string().to_lowercase()];
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
        directives.join(",")
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// A subscriber that is already installed is left in place.
pub fn init_logging(settings: &LogSettings) {
    let filter = EnvFilter::try_new(settings.directives())
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
    };

    if let Err(e) = installed {
        tracing::debug!("Logging already initialized: {}", e);
    }
}

/// Install the global subscriber from `LOG_*` environment variables
pub fn init_default_logging() {
    init_logging(&LogSettings::from_env());
}

/// Map a `LOG_LEVEL` value to a tracing level, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Span around one gateway request
#[macro_export]
macro_rules! dispatch_span {
    ($($field:tt)*) => {
        tracing::info_span!("dispatch", $($field)*)
    };
}

/// Span around one health probe of one backend
#[macro_export]
macro_rules! probe_span {
    ($($field:tt)*) => {
        tracing::debug_span!("health_probe", $($field)*)
    };
}

/// Span around one adapter call to one backend
#[macro_export]
macro_rules! adapter_span {
    ($($field:tt)*) => {
        tracing::info_span!("adapter_call", $($field)*)
    };
}

pub use {adapter_span, dispatch_span, probe_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Debug", Level::DEBUG),
            ("trace", Level::TRACE),
            ("info", Level::INFO),
            ("verbose", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_directives_quiet_http_plumbing() {
        let settings = LogSettings::default().with_level(Level::DEBUG);
        let directives = settings.directives();
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.contains("warp=warn"));
    }

    #[test]
    fn test_rust_log_override_replaces_directives() {
        let settings = LogSettings {
            filter_override: Some("taskgate=trace".to_string()),
            ..LogSettings::default()
        };
        assert_eq!(settings.directives(), "taskgate=trace");
    }

    #[test]
    fn test_span_events_follow_setting() {
        let quiet = LogSettings::default();
        assert_eq!(quiet.span_events(), FmtSpan::NONE);
        let noisy = LogSettings {
            include_spans: true,
            ..LogSettings::default()
        };
        assert_eq!(noisy.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(&LogSettings::default());
        init_logging(&LogSettings::default().with_level(Level::DEBUG));
    }
}
