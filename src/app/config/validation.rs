use super::groups::{ListenerGroup, PortSelection};
use super::{Config, ConfigError};
use crate::domain::EntityType;
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.server).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid server URL '{}': {}", self.server, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "Server URL '{}' must use http or https",
                self.server
            )));
        }

        let mut listeners = 0;
        for group in ListenerGroup::ALL {
            let ports = self.listener_ports(group).map_err(|e| {
                ConfigError::InvalidConfig(format!("{}: {}", group.option_name(), e))
            })?;
            listeners += ports.len();
        }
        if listeners == 0 {
            return Err(ConfigError::InvalidConfig(
                "At least one listener port must be configured".to_string(),
            ));
        }

        if self.flush_threads == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "Flush threads must be greater than 0".to_string(),
            ));
        }

        for entity in EntityType::ALL {
            if self.batch_size_override(entity) == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Batch size for {entity} must be greater than 0"
                )));
            }
            if let Some(rate) = self.rate_limit_override(entity)
                && (!rate.is_finite() || rate < 0.0)
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "Rate limit for {entity} must be a non-negative number, got {rate}"
                )));
            }
        }

        if self.push_flush_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Flush interval must be greater than 0".to_string(),
            ));
        }

        if self.memory_queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "Memory queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.buffer_partition_size_mb == 0 {
            return Err(ConfigError::InvalidConfig(
                "Buffer partition size must be greater than 0".to_string(),
            ));
        }

        if !self.retry_backoff_base_seconds.is_finite() || self.retry_backoff_base_seconds < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "Retry backoff base must be at least 1.0, got {}",
                self.retry_backoff_base_seconds
            )));
        }

        if self.traffic_shaping
            && (self.traffic_shaping_window_seconds == 0
                || !self.traffic_shaping_headroom.is_finite()
                || self.traffic_shaping_headroom < 1.0)
        {
            return Err(ConfigError::InvalidConfig(
                "Traffic shaping needs a non-zero window and a headroom of at least 1.0"
                    .to_string(),
            ));
        }

        if !self.queue_name_template.contains("{{entity}}")
            || !self.queue_name_template.contains("{{port}}")
        {
            return Err(ConfigError::InvalidConfig(format!(
                "Queue name template '{}' must contain {{{{entity}}}} and {{{{port}}}}",
                self.queue_name_template
            )));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Shutdown timeout must be greater than 0".to_string(),
            ));
        }

        if self.connection_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Connection and request timeouts must be greater than 0".to_string(),
            ));
        }

        if let Some(ports) = &self.export_queue_ports {
            PortSelection::parse(ports)?;
            if self.export_queue_output_file.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "export_queue_ports requires export_queue_output_file".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_server_url() {
        let mut config = Config {
            server: "not-a-url".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));

        config.server = "ftp://backend:21/".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_listener_ports_validated() {
        let config = Config {
            push_listener_ports: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            push_listener_ports: String::new(),
            log_listener_ports: Some("5140".to_string()),
            ..Config::default()
        };
        config.validate().unwrap();

        let config = Config {
            trace_listener_ports: Some("30001,x".to_string()),
            ..Config::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("trace_listener_ports"), "{err}");
    }

    #[test]
    fn test_numeric_bounds() {
        let cases = [
            Config {
                flush_threads: Some(0),
                ..Config::default()
            },
            Config {
                push_flush_max_spans: Some(0),
                ..Config::default()
            },
            Config {
                push_rate_limit: Some(-1.0),
                ..Config::default()
            },
            Config {
                retry_backoff_base_seconds: 0.5,
                ..Config::default()
            },
            Config {
                traffic_shaping: true,
                traffic_shaping_headroom: 0.9,
                ..Config::default()
            },
            Config {
                shutdown_timeout_secs: 0,
                ..Config::default()
            },
        ];

        for config in cases {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_queue_name_template_placeholders() {
        let config = Config {
            queue_name_template: "proxy-{{id}}".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_export_requires_output_file() {
        let mut config = Config {
            export_queue_ports: Some("2878".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.export_queue_output_file = Some(PathBuf::from("/tmp/out.txt"));
        config.validate().unwrap();
    }
}
