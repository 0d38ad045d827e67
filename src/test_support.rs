//! Shared test fixtures. Only compiled for tests.

use std::collections::HashMap;

use uuid::Uuid;

use crate::eval::{EvalStatus, Evaluation, SchedulerType, TriggeredBy};

pub fn sample_eval(namespace: &str, job_id: &str) -> Evaluation {
    Evaluation {
        id: Uuid::new_v4(),
        job_id: job_id.to_string(),
        namespace: namespace.to_string(),
        r#type: SchedulerType::Service,
        priority: 50,
        triggered_by: TriggeredBy::JobRegister,
        create_index: 1,
        snapshot_index: 0,
        modify_index: 1,
        wait: None,
        wait_until: None,
        node_id: None,
        class_eligibility: HashMap::new(),
        escaped_computed_class: false,
        quota_limit_reached: None,
        status: EvalStatus::Pending,
        job_modify_index: 1,
        queued_allocations: HashMap::new(),
    }
}
