use super::ConfigError;
use crate::domain::{EntityType, HandlerKey};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A listener port list and the entity types each of its ports carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerGroup {
    Push,
    Trace,
    Log,
}

impl ListenerGroup {
    pub const ALL: [ListenerGroup; 3] = [ListenerGroup::Push, ListenerGroup::Trace, ListenerGroup::Log];

    pub fn entity_types(&self) -> &'static [EntityType] {
        match self {
            ListenerGroup::Push => &[
                EntityType::Points,
                EntityType::DeltaCounters,
                EntityType::Histograms,
                EntityType::SourceTags,
                EntityType::Events,
            ],
            ListenerGroup::Trace => &[EntityType::Spans, EntityType::SpanLogs],
            ListenerGroup::Log => &[EntityType::Logs],
        }
    }

    pub fn option_name(&self) -> &'static str {
        match self {
            ListenerGroup::Push => "push_listener_ports",
            ListenerGroup::Trace => "trace_listener_ports",
            ListenerGroup::Log => "log_listener_ports",
        }
    }
}

/// Splits a comma-separated port list, ignoring blanks. Every entry must be a
/// non-zero TCP port.
pub fn parse_ports(list: &str) -> Result<Vec<String>, ConfigError> {
    let mut ports = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match entry.parse::<u16>() {
            Ok(port) if port > 0 => {
                let port = port.to_string();
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
            _ => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Invalid port '{entry}' in '{list}'"
                )));
            }
        }
    }
    Ok(ports)
}

/// Which pipelines an export covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelection {
    All,
    Ports(BTreeSet<String>),
}

impl PortSelection {
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        if list.trim().eq_ignore_ascii_case("all") {
            return Ok(PortSelection::All);
        }
        let ports: BTreeSet<String> = parse_ports(list)?.into_iter().collect();
        if ports.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "export_queue_ports names no ports".to_string(),
            ));
        }
        Ok(PortSelection::Ports(ports))
    }

    pub fn matches(&self, key: &HandlerKey) -> bool {
        match self {
            PortSelection::All => true,
            PortSelection::Ports(ports) => ports.contains(key.handle()),
        }
    }
}

/// Operator request to dump buffered items as plaintext and exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub ports: PortSelection,
    pub output: PathBuf,
    pub retain: bool,
}
