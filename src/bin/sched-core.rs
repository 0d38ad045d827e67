//! Local exercising entry point for the evaluation pipeline core.
//!
//! This binary only boots the ambient stack (logging, config) and reports
//! the tunables it resolved — a real server binds the `LogClient`,
//! `StateSnapshot`, `TimeIndexMap`, and `AutopilotBackend` traits to its own
//! replicated-log and state-store implementations and wires the components
//! in `sched_core` together; those concrete adapters are out of scope here
//! (spec.md §1).
//!
//! Reads config from:
//!   SCHED_CONFIG — path to a YAML config file (optional; defaults apply
//!                  for any tunable it omits, or entirely if unset)

use sched_core::config::SchedulerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sched_core=debug".into()),
        )
        .init();

    let config = SchedulerConfig::load().expect("failed to load scheduler config");

    tracing::info!(
        nack_timeout_ms = config.broker.nack_timeout.as_millis() as u64,
        delivery_limit = config.broker.delivery_limit,
        prune_interval_s = config.blocked.prune_interval.as_secs(),
        dequeue_timeout_ms = config.worker.dequeue_timeout.as_millis() as u64,
        max_ids_per_reap = config.gc.max_ids_per_reap,
        "scheduling core config resolved; awaiting embedding server to wire ports"
    );
}
