pub mod api;
pub mod client;
pub mod error;
pub mod factory;
pub mod handle;
pub mod task;

pub use api::{BackendApi, SubmissionOutcome};
pub use client::{ClientConfig, ClientError, ConnectionStats, HttpBackendApi};
pub use error::{FactoryError, ReportError};
pub use factory::{DEFAULT_SHUTDOWN_TIMEOUT, PipelineState, SenderTaskFactory, ShutdownSummary};
pub use handle::{DrainSummary, PipelineHandle, ReportOutcome};
pub use task::{BatchSource, CycleReport, SenderContext, SenderTask, ShardState};
