//! Error types for each component of the scheduling core.
//!
//! Mirrors the teacher crate's pattern of one `thiserror` enum per
//! subsystem rather than a single crate-wide error type.

use crate::eval::EvalId;

/// Errors surfaced by the [`crate::broker::EvalBroker`].
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("evaluation {0} is not outstanding")]
    NotOutstanding(EvalId),

    #[error("token mismatch for evaluation {0}")]
    TokenMismatch(EvalId),

    #[error("broker is disabled")]
    Disabled,
}

/// Errors surfaced by the [`crate::blocked::BlockedEvals`] tracker.
#[derive(Debug, thiserror::Error)]
pub enum BlockedEvalsError {
    #[error("blocked tracker is disabled")]
    Disabled,

    #[error("evaluation {0} is not tracked as blocked")]
    NotTracked(EvalId),
}

/// Errors surfaced by the [`crate::periodic::PeriodicDispatcher`].
#[derive(Debug, thiserror::Error)]
pub enum PeriodicError {
    #[error("periodic dispatcher is disabled")]
    Disabled,

    #[error("job {namespace}/{job_id} is not periodic")]
    NotPeriodic { namespace: String, job_id: String },

    #[error("failed to copy job {namespace}/{job_id} for periodic dispatch: {reason}")]
    CopyFailed {
        namespace: String,
        job_id: String,
        reason: String,
    },

    #[error("log submission failed: {0}")]
    Log(#[from] anyhow::Error),
}

/// Errors surfaced by the [`crate::worker::SchedulerWorker`] loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no cluster leader available")]
    NoLeader,

    #[error("plan queue is disabled")]
    PlanQueueDisabled,

    #[error("timed out waiting for snapshot at index {0}")]
    SnapshotTimeout(u64),

    #[error("scheduler version mismatch: server advertises {server}, eval requires {required}")]
    VersionMismatch { server: u64, required: u64 },

    #[error("scheduler processing failed: {0}")]
    Scheduler(#[source] anyhow::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("worker is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the [`crate::gc::CoreScheduler`].
#[derive(Debug, thiserror::Error)]
pub enum CoreSchedulerError {
    #[error("unknown core job kind: {0}")]
    UnknownKind(String),

    #[error("reap batch {index} of job {job_id} failed: {source}")]
    ReapFailed {
        job_id: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("rekey loop aborted before completion, requeued as {0}")]
    RekeyDeferred(EvalId),
}
