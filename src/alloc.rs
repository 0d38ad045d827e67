//! Allocation — opaque to the scheduling core except for the fields named
//! in spec.md §3 and consulted by §4.H's GC eligibility rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Running,
    Failed,
    Complete,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RescheduleTracker {
    pub events: Vec<RescheduleEvent>,
}

impl RescheduleTracker {
    pub fn last_reschedule_time(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.reschedule_time).max()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub job_id: String,
    pub namespace: String,
    pub node_id: String,
    pub client_status: ClientStatus,
    pub desired_status: DesiredStatus,
    pub reschedule_tracker: RescheduleTracker,
    /// Set when this allocation was already replaced by a reschedule.
    pub next_allocation: Option<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.client_status,
            ClientStatus::Failed | ClientStatus::Complete | ClientStatus::Lost
        )
    }

    pub fn has_failed(&self) -> bool {
        self.client_status == ClientStatus::Failed
    }
}
