use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Invalid log level '{input}'. Valid levels: {valid_levels:?}")]
    InvalidLogLevel {
        input: String,
        valid_levels: Vec<String>,
    },

    #[error("Invalid directive format '{input}'. Expected: 'target=level'")]
    InvalidDirectiveFormat { input: String },

    #[error("Empty target in directive '{input}'")]
    EmptyTarget { input: String },

    #[error("Logging system initialization failed: {details}")]
    LoggingInitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Resource initialization failed: {resource}")]
    ResourceInitFailed {
        resource: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl InitializationError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InitializationError::InvalidLogLevel { .. }
                | InitializationError::InvalidDirectiveFormat { .. }
                | InitializationError::EmptyTarget { .. }
        )
    }

    pub fn fallback_strategy(&self) -> FallbackStrategy {
        match self {
            InitializationError::InvalidLogLevel { .. } => FallbackStrategy::UseDefaultLevel,
            InitializationError::InvalidDirectiveFormat { .. }
            | InitializationError::EmptyTarget { .. } => FallbackStrategy::SkipDirective,
            InitializationError::LoggingInitFailed { .. }
            | InitializationError::ResourceInitFailed { .. } => FallbackStrategy::AbortStartup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    UseDefaultLevel,
    SkipDirective,
    AbortStartup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = InitializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(InitializationError::InvalidLogLevel {
                input: s.to_string(),
                valid_levels: VALID_LEVELS.iter().map(|l| (*l).to_string()).collect(),
            }),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One `target=level` entry of the tracing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(directive: &str) -> Result<Self, InitializationError> {
        let Some((target, level)) = directive.split_once('=') else {
            return Err(InitializationError::InvalidDirectiveFormat {
                input: directive.to_string(),
            });
        };
        if level.contains('=') {
            return Err(InitializationError::InvalidDirectiveFormat {
                input: directive.to_string(),
            });
        }

        let target = target.trim();
        if target.is_empty() {
            return Err(InitializationError::EmptyTarget {
                input: directive.to_string(),
            });
        }

        Ok(LogDirective::new(target, level.parse()?))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" Debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);

        let err = "verbose".parse::<LogLevel>().unwrap_err();
        match err {
            InitializationError::InvalidLogLevel { input, valid_levels } => {
                assert_eq!(input, "verbose");
                assert_eq!(valid_levels.len(), 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_log_directive_parsing() {
        let directive = LogDirective::parse("RawBlockedPoints=warn").unwrap();
        assert_eq!(directive, LogDirective::new("RawBlockedPoints", LogLevel::Warn));
        assert_eq!(directive.to_filter_string(), "RawBlockedPoints=warn");

        let directive = LogDirective::parse(" telemetry_proxy::sender = trace").unwrap();
        assert_eq!(directive.target, "telemetry_proxy::sender");
        assert_eq!(directive.level, LogLevel::Trace);
    }

    #[test]
    fn test_log_directive_parsing_invalid_cases() {
        assert!(matches!(
            LogDirective::parse("reqwest"),
            Err(InitializationError::InvalidDirectiveFormat { .. })
        ));
        assert!(matches!(
            LogDirective::parse("a=b=c"),
            Err(InitializationError::InvalidDirectiveFormat { .. })
        ));
        assert!(matches!(
            LogDirective::parse(" =info"),
            Err(InitializationError::EmptyTarget { .. })
        ));
        assert!(matches!(
            LogDirective::parse("hyper=loud"),
            Err(InitializationError::InvalidLogLevel { .. })
        ));
    }

    #[test]
    fn test_fallback_strategy() {
        let err = InitializationError::EmptyTarget {
            input: "=info".to_string(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.fallback_strategy(), FallbackStrategy::SkipDirective);

        let err = InitializationError::LoggingInitFailed {
            details: "subscriber already set".to_string(),
            source: Box::new(std::io::Error::other("boom")),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.fallback_strategy(), FallbackStrategy::AbortStartup);
    }
}
