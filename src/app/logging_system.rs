use super::initialization::{FallbackStrategy, InitializationError, LogDirective, LogLevel};
use crate::domain::EntityType;
use parking_lot::RwLock;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directives for the process-wide tracing subscriber.
#[derive(Debug)]
pub struct LoggingSystem {
    directives: RwLock<Vec<LogDirective>>,
    fallback_level: LogLevel,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: RwLock::new(Vec::new()),
            fallback_level: LogLevel::Info,
        }
    }

    /// Adds a `target=level` directive. A bad level falls back to the default
    /// level and a malformed directive is skipped.
    pub fn add_directive(&self, directive_str: &str) -> Result<(), InitializationError> {
        match LogDirective::parse(directive_str) {
            Ok(directive) => {
                self.directives.write().push(directive);
                Ok(())
            }
            Err(e) => match e.fallback_strategy() {
                FallbackStrategy::UseDefaultLevel => {
                    eprintln!("Warning: {e}, using default level");
                    let target = directive_str.split('=').next().unwrap_or_default().trim();
                    self.directives
                        .write()
                        .push(LogDirective::new(target, self.fallback_level));
                    Ok(())
                }
                FallbackStrategy::SkipDirective => {
                    eprintln!("Warning: {e}, skipping directive");
                    Ok(())
                }
                FallbackStrategy::AbortStartup => Err(e),
            },
        }
    }

    /// Quiets the HTTP stack and keeps the blocked-item sinks visible.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
        for entity in EntityType::ALL {
            let target = entity.blocked_logger();
            if !directives.iter().any(|d| d.target == target) {
                directives.push(LogDirective::new(target, LogLevel::Info));
            }
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        std::iter::once(default_level.as_str().to_string())
            .chain(directives.iter().map(LogDirective::to_filter_string))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn initialize_tracing(&self, default_level: LogLevel) -> Result<(), InitializationError> {
        let filter_string = self.build_filter_string(default_level);
        let env_filter = EnvFilter::try_new(&filter_string).map_err(|e| {
            InitializationError::LoggingInitFailed {
                details: format!("Failed to create EnvFilter with '{filter_string}'"),
                source: Box::new(e),
            }
        })?;

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .compact(),
        );

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            InitializationError::LoggingInitFailed {
                details: "Failed to set global tracing subscriber".to_string(),
                source: Box::new(e),
            }
        })
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global subscriber once per process. Later calls report the
/// outcome of the first one.
pub fn setup_logging_safe(level: LogLevel, directives: &[String]) -> Result<(), InitializationError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let outcome = INIT.get_or_init(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        for directive in directives {
            logging_system
                .add_directive(directive)
                .map_err(|e| e.to_string())?;
        }
        logging_system
            .initialize_tracing(level)
            .map_err(|e| e.to_string())
    });

    outcome
        .clone()
        .map_err(|details| InitializationError::LoggingInitFailed {
            details,
            source: Box::new(std::io::Error::other("logging initialization error")),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_valid_directive() {
        let system = LoggingSystem::new();
        system.add_directive("telemetry_proxy::buffer=debug").unwrap();

        assert_eq!(system.directive_count(), 1);
        assert_eq!(
            system.build_filter_string(LogLevel::Warn),
            "warn,telemetry_proxy::buffer=debug"
        );
    }

    #[test]
    fn test_invalid_directives_fall_back() {
        let system = LoggingSystem::new();
        system.add_directive("reqwest=chatty").unwrap();
        system.add_directive("no-level-here").unwrap();

        assert_eq!(system.directive_count(), 1);
        assert_eq!(system.build_filter_string(LogLevel::Error), "error,reqwest=info");
    }

    #[test]
    fn test_default_directives_cover_blocked_loggers() {
        let system = LoggingSystem::new();
        system.add_default_directives();
        let filter = system.build_filter_string(LogLevel::Info);

        assert!(filter.starts_with("info,hyper=warn"));
        assert!(filter.contains("reqwest=warn"));
        assert!(filter.contains("RawBlockedPoints=info"));
        assert!(filter.contains("RawBlockedLogs=info"));
        assert_eq!(filter.matches("RawBlockedPoints").count(), 1);
    }

    #[test]
    fn test_filter_string_parses_as_env_filter() {
        let system = LoggingSystem::new();
        system.add_default_directives();
        system.add_directive("telemetry_proxy=trace").unwrap();

        assert!(EnvFilter::try_new(system.build_filter_string(LogLevel::Debug)).is_ok());
    }

    #[test]
    fn test_setup_logging_safe_is_idempotent() {
        let first = setup_logging_safe(LogLevel::Info, &[]);
        let second = setup_logging_safe(LogLevel::Debug, &["reqwest=debug".to_string()]);
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
