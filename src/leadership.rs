//! The leadership gate (spec.md §4.I): enables and disables the broker,
//! blocked tracker, and periodic dispatcher on leadership transitions.

use tracing::instrument;

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::periodic::PeriodicDispatcher;

/// Starts and stops the leader-resident evaluation pipeline components in
/// the order spec.md §4.I names: broker, then blocked tracker, then
/// periodic dispatcher.
pub struct LeadershipGate {
    broker: EvalBroker,
    blocked: BlockedEvals,
    periodic: PeriodicDispatcher,
}

impl LeadershipGate {
    pub fn new(broker: EvalBroker, blocked: BlockedEvals, periodic: PeriodicDispatcher) -> Self {
        Self {
            broker,
            blocked,
            periodic,
        }
    }

    /// Called when this server wins leadership: enables D, E, F in order.
    #[instrument(skip(self))]
    pub async fn establish_leadership(&self) {
        tracing::info!("establishing leadership: enabling evaluation pipeline");
        self.broker.set_enabled(true).await;
        self.blocked.set_enabled(true).await;
        self.periodic.set_enabled(true).await;
    }

    /// Called on demotion: disables D, E, F, which flushes their
    /// in-memory state (spec.md §4.D/§4.E/§4.F Failure semantics).
    #[instrument(skip(self))]
    pub async fn revoke_leadership(&self) {
        tracing::info!("revoking leadership: disabling evaluation pipeline");
        self.broker.set_enabled(false).await;
        self.blocked.set_enabled(false).await;
        self.periodic.set_enabled(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockedEvalsConfig, BrokerConfig};
    use crate::ports::TimeIndexMap;
    use std::sync::Arc;

    struct FixedTimeIndex;
    impl TimeIndexMap for FixedTimeIndex {
        fn nearest_index(&self, _at: chrono::DateTime<chrono::Utc>) -> u64 {
            0
        }
    }

    struct StubLog;
    #[async_trait::async_trait]
    impl crate::ports::LogClient for StubLog {
        async fn submit_eval_update(&self, _evals: Vec<crate::eval::Evaluation>) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn submit_eval_reap(&self, _batch: crate::ports::ReapBatch) -> anyhow::Result<u64> {
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
        ) -> anyhow::Result<crate::ports::PlanResult> {
            unimplemented!()
        }
        async fn snapshot_min_index(
            &self,
            _idx: u64,
            _deadline: std::time::Duration,
        ) -> anyhow::Result<Box<dyn crate::ports::StateSnapshot>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn establish_then_revoke_toggles_all_three() {
        let broker = EvalBroker::new(BrokerConfig::default());
        let blocked = BlockedEvals::new(broker.clone(), Arc::new(FixedTimeIndex), BlockedEvalsConfig::default());
        let periodic = PeriodicDispatcher::new(Arc::new(StubLog));
        let gate = LeadershipGate::new(broker.clone(), blocked.clone(), periodic.clone());

        gate.establish_leadership().await;
        broker.enqueue(crate::test_support::sample_eval("ns", "job")).await;
        assert_eq!(broker.stats().await.ready, 1);

        gate.revoke_leadership().await;
        assert_eq!(broker.stats().await.ready, 0);
    }
}
