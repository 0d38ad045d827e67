//! The stats/telemetry tap (spec.md §4.K): periodic gauges derived from
//! the broker's and blocked tracker's state, emitted as structured
//! `tracing` events rather than through a metrics sink (out of scope per
//! spec.md §1).

use std::time::Duration;

use tokio::sync::watch;

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;

/// Periodically snapshots broker/blocked stats and emits them as a single
/// `tracing::info!` event, matching the teacher's periodic-log style
/// rather than introducing a metrics-exporter dependency.
pub struct StatsTap {
    broker: EvalBroker,
    blocked: BlockedEvals,
    interval: Duration,
}

impl StatsTap {
    pub fn new(broker: EvalBroker, blocked: BlockedEvals, interval: Duration) -> Self {
        Self {
            broker,
            blocked,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.emit_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn emit_once(&self) {
        let broker_stats = self.broker.stats().await;
        let blocked_stats = self.blocked.stats().await;
        tracing::info!(
            broker.ready = broker_stats.ready,
            broker.unacked = broker_stats.unacked,
            broker.waiting = broker_stats.waiting,
            broker.blocked = broker_stats.blocked,
            broker.failed = broker_stats.failed,
            blocked.captured = blocked_stats.captured,
            blocked.escaped = blocked_stats.escaped,
            blocked.jobs = blocked_stats.jobs,
            "evaluation pipeline stats"
        );
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

    #[tokio::test]
    async fn emit_once_reads_both_components_without_panicking() {
        let broker = EvalBroker::new(BrokerConfig::default());
        broker.set_enabled(true).await;
        let blocked = BlockedEvals::new(broker.clone(), Arc::new(FixedTimeIndex), BlockedEvalsConfig::default());
        blocked.set_enabled(true).await;

        let tap = StatsTap::new(broker, blocked, Duration::from_secs(1));
        tap.emit_once().await;
    }
}
