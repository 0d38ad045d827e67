//! The evaluation data model — the unit of scheduling work.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier for an evaluation.
pub type EvalId = Uuid;

/// Lease token minted by the broker on dequeue.
pub type Token = Uuid;

/// The kind of scheduler an evaluation is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    Service,
    Batch,
    System,
    Core,
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Service => "service",
            Self::Batch => "batch",
            Self::System => "system",
            Self::Core => "core",
        };
        write!(f, "{s}")
    }
}

/// Why an evaluation was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggeredBy {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    PeriodicJob,
    RollingUpdate,
    MaxPlans,
    QueuedAllocs,
    Reschedule,
    FailedFollowUp,
    AllocStop,
    Other(String),
}

impl TriggeredBy {
    pub fn is_max_plans(&self) -> bool {
        matches!(self, Self::MaxPlans)
    }
}

/// Terminal/non-terminal status of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Pending,
    Blocked,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    /// `TerminalStatus()` from spec.md — anything other than pending/blocked.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Blocked)
    }
}

/// A scheduling unit for one job. Not a plan, not a placement — a request
/// to compute placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    pub job_id: String,
    pub namespace: String,
    pub r#type: SchedulerType,
    pub priority: i64,
    pub triggered_by: TriggeredBy,

    pub create_index: u64,
    /// Log index of the snapshot a scheduler saw when it last processed this eval.
    pub snapshot_index: u64,
    pub modify_index: u64,

    /// Duration before the eval becomes ready for the first time.
    pub wait: Option<std::time::Duration>,
    /// Absolute time gate; mutually informative with `wait`.
    pub wait_until: Option<DateTime<Utc>>,
    /// Set for node-scoped system evaluations.
    pub node_id: Option<String>,

    /// computed-node-class -> eligible. Absence of a key is NOT the same as `false`.
    pub class_eligibility: HashMap<String, bool>,
    /// True if constraints escape computed-node-class precomputation.
    pub escaped_computed_class: bool,
    /// Name of the quota limit reached, empty/None if no quota blocked this eval.
    pub quota_limit_reached: Option<String>,

    pub status: EvalStatus,

    /// `JobModifyIndex` the job had when this eval's commit returned, used
    /// by periodic dispatch and by reschedule/GC bookkeeping.
    pub job_modify_index: u64,

    /// Filled in by the worker: summary of the allocations this eval queued,
    /// used by `ReblockEval` to reconcile against the job summary.
    pub queued_allocations: HashMap<String, u64>,
}

impl Evaluation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Key used for per-job serialization in the broker and blocked tracker.
    pub fn job_key(&self) -> (String, String) {
        (self.namespace.clone(), self.job_id.clone())
    }

    /// `latestIndex(E) = max(E.CreateIndex, E.SnapshotIndex)` — used to break
    /// ties in duplicate reconciliation (§4.E).
    pub fn latest_index(&self) -> u64 {
        self.create_index.max(self.snapshot_index)
    }

    /// True if this eval is ready to be placed in the broker's `ready` set
    /// immediately (no `Wait`/`WaitUntil` gate pending).
    pub fn is_immediately_ready(&self, now: DateTime<Utc>) -> bool {
        if let Some(wait) = self.wait {
            if wait > std::time::Duration::ZERO {
                return false;
            }
        }
        if let Some(until) = self.wait_until {
            if until > now {
                return false;
            }
        }
        true
    }
}

/// Internal envelope minted on Block/Reblock; destroyed on unblock/untrack,
/// and on dequeue/ack/nack within the broker.
#[derive(Debug, Clone)]
pub struct WrappedEvaluation {
    pub eval: Evaluation,
    pub token: Option<Token>,
}

impl WrappedEvaluation {
    pub fn new(eval: Evaluation) -> Self {
        Self { eval, token: None }
    }

    pub fn with_token(eval: Evaluation, token: Token) -> Self {
        Self {
            eval,
            token: Some(token),
        }
    }
}
