//! Job and related opaque types. The scheduling core treats jobs as opaque
//! except for the fields it must inspect directly (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub namespace: String,
    pub r#type: crate::eval::SchedulerType,
    pub status: JobStatus,
    pub stop: bool,
    pub parameterized_job: bool,
    pub create_index: u64,
    pub modify_index: u64,
    pub job_modify_index: u64,

    /// `None` for non-periodic jobs.
    pub periodic: Option<PeriodicConfig>,

    /// Set on derived jobs instantiated by the periodic dispatcher.
    pub parent_id: Option<String>,

    pub reschedule_policy: ReschedulePolicy,
}

impl Job {
    pub fn is_alive(&self) -> bool {
        self.status != JobStatus::Dead && !self.stop
    }

    pub fn is_periodic_dispatchable(&self) -> bool {
        self.periodic.as_ref().is_some_and(|p| !p.disabled) && !self.parameterized_job && !self.stop
    }

    /// Deep-copies this job into a derived child for periodic dispatch
    /// (spec.md §4.F "Derived Job"): sets `ParentID`, a time-stamped `ID`,
    /// and clears `Periodic`.
    pub fn derive_child(&self, launch_time: DateTime<Utc>) -> Job {
        let mut child = self.clone();
        child.parent_id = Some(self.id.clone());
        child.id = format!("{}/periodic-{}", self.id, launch_time.timestamp());
        child.periodic = None;
        child
    }
}

/// Opaque cron-like schedule. The concrete expression syntax is out of
/// scope (spec.md §1 Non-goals) — callers provide a `PeriodicSchedule`
/// implementation; `disabled` and the rest of the fields this crate reads
/// directly are still modeled so `Add`'s precondition checks can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    pub disabled: bool,
    pub time_zone: String,
}

/// Computes the next firing time for a periodic job. Concrete cron parsing
/// is an external collaborator; this crate only consumes the trait.
pub trait PeriodicSchedule: Send + Sync {
    fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// A fixed list of absolute instants, useful as a test double and for
/// embedding servers that pre-expand schedules externally.
#[derive(Debug, Clone, Default)]
pub struct FixedInstants(pub Vec<DateTime<Utc>>);

impl PeriodicSchedule for FixedInstants {
    fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.0.iter().filter(|t| **t > now).min().copied()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub enabled: bool,
    pub unlimited: bool,
    pub attempts: u32,
    pub interval: std::time::Duration,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            unlimited: false,
            attempts: 0,
            interval: std::time::Duration::from_secs(0),
        }
    }
}
