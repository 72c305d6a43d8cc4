use crate::domain::{HandlerKey, Item};
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Result of one submission to the telemetry backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Delivered,
    /// The backend refused the items at `indices`, or the whole payload
    /// when there are none.
    Rejected {
        indices: Option<Vec<usize>>,
        message: String,
    },
    RateLimited,
    Unavailable(String),
}

impl SubmissionOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SubmissionOutcome::Delivered)
    }
}

/// Remote endpoint that accepts batches of telemetry items.
///
/// Implementations bound every call by a timeout and report it as
/// `Unavailable`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn submit(&self, key: &HandlerKey, items: &[Item]) -> SubmissionOutcome;
}
