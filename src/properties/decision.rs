//! Failure policy: which action a sender takes for a failed or throttled batch.
//!
//! The table is a pure function of the queueing level, the kind of failure and
//! the split toggle, so it is tested here on its own.

use super::entity::QueueingLevel;
use crate::domain::QueueingReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Backend unreachable, 5xx or timed out.
    Unavailable,
    /// Backend refused some items of the payload.
    Rejected,
    /// Backend answered with a rate-limit status.
    BackendRateLimited,
    /// The local limiter has no allowance left for the batch.
    LocalRateLimited,
    /// The in-memory inbox is at its item bound.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Discard the batch after logging it.
    Drop,
    /// Write the batch to the task queue and back off the shard.
    Persist(QueueingReason),
    /// Halve the batch and submit each half on its own.
    SplitAndRetry,
    /// Drop the offending items and resubmit the remainder right away.
    DropRejectedAndResubmit,
    /// Wait until capacity is available.
    Block,
    /// Keep the batch where it is and try again next cycle.
    Defer,
}

pub fn decide(level: QueueingLevel, kind: FailureKind, split_enabled: bool) -> FailureAction {
    use FailureAction::*;
    use FailureKind::*;

    match (level, kind) {
        (_, Rejected) => DropRejectedAndResubmit,
        (_, BackendRateLimited) if split_enabled => SplitAndRetry,

        (QueueingLevel::Memory, Unavailable | BackendRateLimited | Overflow) => Drop,
        (QueueingLevel::Memory, LocalRateLimited) => Defer,

        (QueueingLevel::Pushback, Unavailable) => Persist(QueueingReason::SubmissionError),
        (QueueingLevel::Pushback, BackendRateLimited) => Persist(QueueingReason::RateLimited),
        (QueueingLevel::Pushback, LocalRateLimited | Overflow) => Block,

        (QueueingLevel::AnyError, Unavailable) => Persist(QueueingReason::SubmissionError),
        (QueueingLevel::AnyError, BackendRateLimited | LocalRateLimited) => {
            Persist(QueueingReason::RateLimited)
        }
        (QueueingLevel::AnyError, Overflow) => Persist(QueueingReason::BufferFull),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FailureAction::*;

    #[test]
    fn test_memory_level_never_persists() {
        for kind in [
            FailureKind::Unavailable,
            FailureKind::Rejected,
            FailureKind::BackendRateLimited,
            FailureKind::LocalRateLimited,
            FailureKind::Overflow,
        ] {
            for split in [false, true] {
                let action = decide(QueueingLevel::Memory, kind, split);
                assert!(!matches!(action, Persist(_) | Block), "{kind:?} -> {action:?}");
            }
        }
        assert_eq!(decide(QueueingLevel::Memory, FailureKind::Unavailable, false), Drop);
    }

    #[test]
    fn test_transient_failures_persist_outside_memory_level() {
        for level in [QueueingLevel::Pushback, QueueingLevel::AnyError] {
            assert_eq!(
                decide(level, FailureKind::Unavailable, true),
                Persist(QueueingReason::SubmissionError)
            );
        }
    }

    #[test]
    fn test_backend_rate_limit_splits_only_when_enabled() {
        assert_eq!(
            decide(QueueingLevel::AnyError, FailureKind::BackendRateLimited, true),
            SplitAndRetry
        );
        assert_eq!(
            decide(QueueingLevel::AnyError, FailureKind::BackendRateLimited, false),
            Persist(QueueingReason::RateLimited)
        );
    }

    #[test]
    fn test_local_limit_and_overflow_by_level() {
        assert_eq!(decide(QueueingLevel::Pushback, FailureKind::LocalRateLimited, false), Block);
        assert_eq!(decide(QueueingLevel::Pushback, FailureKind::Overflow, false), Block);
        assert_eq!(
            decide(QueueingLevel::AnyError, FailureKind::LocalRateLimited, false),
            Persist(QueueingReason::RateLimited)
        );
        assert_eq!(
            decide(QueueingLevel::AnyError, FailureKind::Overflow, false),
            Persist(QueueingReason::BufferFull)
        );
        assert_eq!(decide(QueueingLevel::Memory, FailureKind::LocalRateLimited, false), Defer);
    }

    #[test]
    fn test_rejection_always_drops_offenders_only() {
        for level in [QueueingLevel::Memory, QueueingLevel::Pushback, QueueingLevel::AnyError] {
            assert_eq!(decide(level, FailureKind::Rejected, false), DropRejectedAndResubmit);
        }
    }
}
