//! Deployment — opaque to the scheduling core except for GC eligibility
//! fields (spec.md §4.H).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub job_id: String,
    pub namespace: String,
    pub active: bool,
    pub modify_index: u64,
}

impl Deployment {
    pub fn is_inactive(&self) -> bool {
        !self.active
    }
}
