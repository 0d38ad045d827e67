//! External collaborator interfaces (spec.md §6): the replicated log, the
//! state-store snapshot, the time-index map, the pluggable placement
//! scheduler, the planner RPC surface, and the autopilot backend. This
//! crate only consumes these traits — concrete implementations live in the
//! embedding server and are out of scope here.

use async_trait::async_trait;
use std::time::Duration;

use crate::alloc::Allocation;
use crate::deployment::Deployment;
use crate::error::WorkerError;
use crate::eval::Evaluation;
use crate::job::Job;
use crate::node::Node;

/// Read-only, point-in-time view of the replicated state (spec.md §2.A).
pub trait StateSnapshot: Send + Sync {
    fn latest_index(&self) -> u64;

    fn job(&self, namespace: &str, job_id: &str) -> Option<Job>;
    /// Jobs in `namespace` whose `ParentID == parent_id` — the derived
    /// children a periodic job dispatched (spec.md §4.F `RunningChildren`).
    fn jobs_by_parent(&self, namespace: &str, parent_id: &str) -> Vec<Job>;
    fn evals_for_job(&self, namespace: &str, job_id: &str) -> Vec<Evaluation>;
    fn allocs_for_job(&self, namespace: &str, job_id: &str) -> Vec<Allocation>;
    fn allocs_for_node(&self, node_id: &str) -> Vec<Allocation>;
    fn deployments_for_job(&self, namespace: &str, job_id: &str) -> Vec<Deployment>;

    fn terminal_evals(&self, up_to_index: u64) -> Vec<Evaluation>;
    fn terminal_allocs(&self, up_to_index: u64) -> Vec<Allocation>;
    fn terminal_nodes(&self, up_to_index: u64) -> Vec<Node>;
    fn inactive_deployments(&self, up_to_index: u64) -> Vec<Deployment>;
    fn jobs_created_before(&self, up_to_index: u64) -> Vec<Job>;
}

/// A batch of ids targeted by a reap request, bounded at the call site to
/// `max_ids_per_reap` (spec.md §4.H).
#[derive(Debug, Clone, Default)]
pub struct ReapBatch {
    pub eval_ids: Vec<uuid::Uuid>,
    pub alloc_ids: Vec<String>,
}

/// Result of a `Plan.Submit` RPC (spec.md §4.G).
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub accepted: bool,
    /// Present when the plan partially failed and the caller should
    /// re-plan from a fresher snapshot.
    pub refresh_index: Option<u64>,
}

/// Submits typed write batches to the replicated log and returns the
/// committed index (spec.md §2.B, §6).
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn submit_eval_update(&self, evals: Vec<Evaluation>) -> anyhow::Result<u64>;
    async fn submit_eval_reap(&self, batch: ReapBatch) -> anyhow::Result<u64>;
    async fn submit_job_batch_deregister(
        &self,
        jobs: Vec<(String, String)>,
    ) -> anyhow::Result<u64>;
    async fn submit_node_batch_deregister(&self, node_ids: Vec<String>) -> anyhow::Result<u64>;
    async fn submit_deployment_delete(&self, deployment_ids: Vec<String>) -> anyhow::Result<u64>;
    async fn submit_job_register(&self, job: Job) -> anyhow::Result<u64>;
    async fn submit_plan(
        &self,
        eval_token: uuid::Uuid,
        snapshot_index: u64,
    ) -> anyhow::Result<PlanResult>;

    /// Block until a snapshot whose `latest_index() >= idx` is available,
    /// or fail once `deadline` elapses (spec.md §6).
    async fn snapshot_min_index(
        &self,
        idx: u64,
        deadline: Duration,
    ) -> anyhow::Result<Box<dyn StateSnapshot>>;
}

/// Maps wall-clock cutoffs to replicated-log indexes, monotonically
/// (spec.md §2.C).
pub trait TimeIndexMap: Send + Sync {
    fn nearest_index(&self, at: chrono::DateTime<chrono::Utc>) -> u64;
}

/// Planner interface provided to pluggable schedulers by the worker
/// (spec.md §4.G).
#[async_trait]
pub trait Planner: Send + Sync {
    async fn submit_plan(
        &self,
        eval_token: uuid::Uuid,
        snapshot_index: u64,
    ) -> Result<PlanResult, WorkerError>;
    async fn update_eval(&self, eval: Evaluation) -> Result<(), WorkerError>;
    async fn create_eval(&self, eval: Evaluation) -> Result<(), WorkerError>;
    async fn reblock_eval(&self, eval: Evaluation) -> Result<(), WorkerError>;
}

/// A pluggable placement scheduler (spec.md §4.G); this crate only
/// supplies [`crate::gc::CoreScheduler`] as a concrete implementation.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn process(
        &self,
        eval: &Evaluation,
        snapshot: &dyn StateSnapshot,
        planner: &dyn Planner,
    ) -> anyhow::Result<()>;
}

/// Exposes server membership to the consensus autopilot library
/// (spec.md §4.J). Federated peers in other regions are never included.
pub trait AutopilotBackend: Send + Sync {
    fn set_servers(&self, server_ids: Vec<String>);
}
