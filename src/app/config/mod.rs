mod cli;
pub mod groups;
mod validation;

use crate::buffer::OverflowPolicy;
use crate::domain::TierKind;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use super::initialization::LogLevel;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error(transparent)]
    Cli(#[from] clap::Error),
}

/// Storage tier every configured pipeline buffers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferTier {
    /// In-process only; backlog is lost on restart.
    Memory,
    /// Append-only journal under `--buffer`.
    #[default]
    Disk,
    /// Remote queue service.
    External,
}

impl From<BufferTier> for TierKind {
    fn from(tier: BufferTier) -> Self {
        match tier {
            BufferTier::Memory => TierKind::Memory,
            BufferTier::Disk => TierKind::Disk,
            BufferTier::External => TierKind::External,
        }
    }
}

/// What a full memory tier does with a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum MemoryOverflow {
    #[default]
    Block,
    DropOldest,
    DropNewest,
}

impl From<MemoryOverflow> for OverflowPolicy {
    fn from(overflow: MemoryOverflow) -> Self {
        match overflow {
            MemoryOverflow::Block => OverflowPolicy::Block,
            MemoryOverflow::DropOldest => OverflowPolicy::DropOldest,
            MemoryOverflow::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

pub use cli::{CONFIG_ENV, Config};
pub use groups::{ExportRequest, ListenerGroup, PortSelection};
