//! The scheduler worker (spec.md §4.G): the long-lived consumer that
//! dequeues from the broker, waits for log catch-up, invokes a pluggable
//! scheduler, submits a plan, and acks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::instrument;

use crate::broker::EvalBroker;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::eval::{Evaluation, SchedulerType};
use crate::ports::{LogClient, Planner, Scheduler};

/// Backoff tier applied after a failed iteration (spec.md §4.G Backoff).
#[derive(Debug, Clone, Copy)]
enum Backoff {
    /// Routine transient errors: fast baseline, no growth.
    Fast,
    /// Plan submission failures: exponential growth bounded by a ceiling.
    Slow(u32),
    /// Scheduler version mismatch: a fixed long backoff.
    VersionMismatch,
}

impl Backoff {
    fn duration(self, config: &WorkerConfig) -> Duration {
        match self {
            Backoff::Fast => config.fast_backoff_baseline,
            Backoff::Slow(attempt) => {
                let scaled = config.slow_backoff_baseline.saturating_mul(1 << attempt.min(16));
                scaled.min(config.slow_backoff_ceiling)
            }
            Backoff::VersionMismatch => config.version_mismatch_backoff,
        }
    }
}

/// Constructs the placement scheduler for an evaluation's type. The core
/// GC scheduler is always used for `Type == core`; everything else is
/// resolved through this factory (spec.md §4.G step 4).
pub trait SchedulerFactory: Send + Sync {
    fn for_eval(&self, eval: &Evaluation) -> Arc<dyn Scheduler>;
}

/// Long-lived consumer owned by the server; exposes `pause` and is
/// started/stopped by the leadership gate (spec.md §4.G).
pub struct SchedulerWorker {
    broker: EvalBroker,
    log: Arc<dyn LogClient>,
    planner: Arc<dyn Planner>,
    factory: Arc<dyn SchedulerFactory>,
    core_scheduler: Arc<dyn Scheduler>,
    config: WorkerConfig,
    enabled_schedulers: Vec<SchedulerType>,
    paused: Arc<AtomicBool>,
}

impl SchedulerWorker {
    pub fn new(
        broker: EvalBroker,
        log: Arc<dyn LogClient>,
        planner: Arc<dyn Planner>,
        factory: Arc<dyn SchedulerFactory>,
        core_scheduler: Arc<dyn Scheduler>,
        config: WorkerConfig,
        enabled_schedulers: Vec<SchedulerType>,
    ) -> Self {
        Self {
            broker,
            log,
            planner,
            factory,
            core_scheduler,
            config,
            enabled_schedulers,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative pause: the main loop checks this at the top of every
    /// iteration (spec.md §4.G Main loop step 1).
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Main loop: honour pause, dequeue, wait for snapshot catch-up,
    /// construct a scheduler, process, ack or nack (spec.md §4.G).
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("scheduler worker started");
        let mut backoff: Option<Backoff> = None;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            }

            if let Some(b) = backoff.take() {
                let delay = b.duration(&self.config);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            let dequeued = tokio::select! {
                d = self.broker.dequeue(&self.enabled_schedulers, self.config.dequeue_timeout) => d,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    None
                }
            };

            let Some((eval, token)) = dequeued else {
                continue;
            };

            match self.process_one(&eval, token, &mut shutdown_rx).await {
                Ok(()) => {
                    backoff = None;
                }
                Err(WorkerError::ShuttingDown) => {
                    let _ = self.broker.nack(eval.id, token).await;
                    break;
                }
                Err(WorkerError::VersionMismatch { .. }) => {
                    let _ = self.broker.nack(eval.id, token).await;
                    backoff = Some(Backoff::VersionMismatch);
                }
                Err(WorkerError::SnapshotTimeout(_)) => {
                    let _ = self.broker.nack(eval.id, token).await;
                    backoff = Some(Backoff::Fast);
                }
                Err(e) => {
                    tracing::warn!(error = %e, eval_id = %eval.id, "scheduler worker iteration failed, nacking");
                    let _ = self.broker.nack(eval.id, token).await;
                    backoff = Some(match backoff {
                        Some(Backoff::Slow(n)) => Backoff::Slow(n + 1),
                        _ => Backoff::Slow(0),
                    });
                }
            }
        }
        tracing::info!("scheduler worker stopped");
    }

    #[instrument(skip(self, eval, shutdown_rx), fields(eval_id = %eval.id, eval_type = %eval.r#type))]
    async fn process_one(
        &self,
        eval: &Evaluation,
        token: uuid::Uuid,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let wait_index = eval.snapshot_index;
        let snapshot = tokio::select! {
            s = self.log.snapshot_min_index(wait_index, self.config.raft_sync_limit) => s,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Err(WorkerError::ShuttingDown);
                }
                return Err(WorkerError::SnapshotTimeout(wait_index));
            }
        };

        let snapshot = match snapshot {
            Ok(s) => s,
            Err(_) => return Err(WorkerError::SnapshotTimeout(wait_index)),
        };

        let scheduler = if eval.r#type == SchedulerType::Core {
            self.core_scheduler.clone()
        } else {
            self.factory.for_eval(eval)
        };

        let result = scheduler
            .process(eval, snapshot.as_ref(), self.planner.as_ref())
            .await;

        match result {
            Ok(()) => {
                self.broker
                    .ack(eval.id, token)
                    .await
                    .map_err(WorkerError::Broker)?;
                Ok(())
            }
            Err(e) => Err(WorkerError::Scheduler(e)),
        }
    }
}

/// Retries transient RPC errors ("no leader", "plan queue disabled") with
/// exponential backoff bounded by the shutdown channel (spec.md §4.G
/// Planner interface).
pub async fn retry_with_backoff<F, Fut, T>(
    mut shutdown_rx: watch::Receiver<bool>,
    baseline: Duration,
    ceiling: Duration,
    mut op: F,
) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, WorkerError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(WorkerError::NoLeader) | Err(WorkerError::PlanQueueDisabled) => {
                let delay = baseline.saturating_mul(1 << attempt.min(16)).min(ceiling);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return Err(WorkerError::ShuttingDown);
                        }
                    }
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::ports::{PlanResult, ReapBatch, StateSnapshot};
    use crate::test_support::sample_eval;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct NoopSnapshot;
    impl StateSnapshot for NoopSnapshot {
        fn latest_index(&self) -> u64 {
            1
        }
        fn job(&self, _ns: &str, _id: &str) -> Option<crate::job::Job> {
            None
        }
        fn jobs_by_parent(&self, _ns: &str, _parent_id: &str) -> Vec<crate::job::Job> {
            Vec::new()
        }
        fn evals_for_job(&self, _ns: &str, _id: &str) -> Vec<Evaluation> {
            Vec::new()
        }
        fn allocs_for_job(&self, _ns: &str, _id: &str) -> Vec<crate::alloc::Allocation> {
            Vec::new()
        }
        fn allocs_for_node(&self, _node_id: &str) -> Vec<crate::alloc::Allocation> {
            Vec::new()
        }
        fn deployments_for_job(&self, _ns: &str, _id: &str) -> Vec<crate::deployment::Deployment> {
            Vec::new()
        }
        fn terminal_evals(&self, _up_to_index: u64) -> Vec<Evaluation> {
            Vec::new()
        }
        fn terminal_allocs(&self, _up_to_index: u64) -> Vec<crate::alloc::Allocation> {
            Vec::new()
        }
        fn terminal_nodes(&self, _up_to_index: u64) -> Vec<crate::node::Node> {
            Vec::new()
        }
        fn inactive_deployments(&self, _up_to_index: u64) -> Vec<crate::deployment::Deployment> {
            Vec::new()
        }
        fn jobs_created_before(&self, _up_to_index: u64) -> Vec<crate::job::Job> {
            Vec::new()
        }
    }

    struct StubLog;
    #[async_trait]
    impl LogClient for StubLog {
        async fn submit_eval_update(&self, _evals: Vec<Evaluation>) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_eval_reap(&self, _batch: ReapBatch) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_job_batch_deregister(
            &self,
            _jobs: Vec<(String, String)>,
        ) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_node_batch_deregister(&self, _node_ids: Vec<String>) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_deployment_delete(&self, _ids: Vec<String>) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_job_register(&self, _job: crate::job::Job) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_plan(
            &self,
            _eval_token: uuid::Uuid,
            _snapshot_index: u64,
        ) -> anyhow::Result<PlanResult> {
            Ok(PlanResult {
                accepted: true,
                refresh_index: None,
            })
        }
        async fn snapshot_min_index(
            &self,
            _idx: u64,
            _deadline: Duration,
        ) -> anyhow::Result<Box<dyn StateSnapshot>> {
            Ok(Box::new(NoopSnapshot))
        }
    }

    struct StubPlanner;
    #[async_trait]
    impl Planner for StubPlanner {
        async fn submit_plan(
            &self,
            _eval_token: uuid::Uuid,
            _snapshot_index: u64,
        ) -> Result<PlanResult, WorkerError> {
            Ok(PlanResult {
                accepted: true,
                refresh_index: None,
            })
        }
        async fn update_eval(&self, _eval: Evaluation) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn create_eval(&self, _eval: Evaluation) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn reblock_eval(&self, _eval: Evaluation) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    struct CountingScheduler {
        processed: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Scheduler for CountingScheduler {
        async fn process(
            &self,
            _eval: &Evaluation,
            _snapshot: &dyn StateSnapshot,
            _planner: &dyn Planner,
        ) -> anyhow::Result<()> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("forced failure");
            }
            Ok(())
        }
    }

    struct SingleFactory(Arc<dyn Scheduler>);
    impl SchedulerFactory for SingleFactory {
        fn for_eval(&self, _eval: &Evaluation) -> Arc<dyn Scheduler> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn processes_and_acks_a_dequeued_eval() {
        let broker = EvalBroker::new(BrokerConfig::default());
        broker.set_enabled(true).await;

        let processed = Arc::new(AtomicU32::new(0));
        let scheduler: Arc<dyn Scheduler> = Arc::new(CountingScheduler {
            processed: processed.clone(),
            fail: false,
        });

        let worker = SchedulerWorker::new(
            broker.clone(),
            Arc::new(StubLog),
            Arc::new(StubPlanner),
            Arc::new(SingleFactory(scheduler.clone())),
            scheduler,
            WorkerConfig::default(),
            vec![SchedulerType::Service],
        );

        let eval = sample_eval("ns", "job-w1");
        broker.enqueue(eval).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = std::sync::Arc::new(worker);
            let w = worker.clone();
            async move { w.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        assert_eq!(processed.load(Ordering::SeqCst), 1);
        let stats = broker.stats().await;
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.ready, 0);
    }
}
