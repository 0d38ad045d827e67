//! Tunables for every component, with defaults matching spec.md, loadable
//! from a YAML file the way the teacher's `WorkflowConfigIndex` loads its
//! routing table, and overridable from the environment for local runs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn de_duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn se_duration_ms<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_millis() as u64)
}

/// Broker tunables (spec.md §4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(
        rename = "nack_timeout_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub nack_timeout: Duration,

    #[serde(
        rename = "initial_nack_delay_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub initial_nack_delay: Duration,

    #[serde(
        rename = "subsequent_nack_delay_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub subsequent_nack_delay: Duration,

    pub delivery_limit: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            nack_timeout: Duration::from_secs(60),
            initial_nack_delay: Duration::from_secs(1),
            subsequent_nack_delay: Duration::from_secs(30),
            delivery_limit: 3,
        }
    }
}

/// Blocked evaluation tracker tunables (spec.md §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedEvalsConfig {
    #[serde(
        rename = "prune_interval_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub prune_interval: Duration,

    #[serde(
        rename = "prune_threshold_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub prune_threshold: Duration,

    pub capacity_change_buffer: usize,
}

impl Default for BlockedEvalsConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(5 * 60),
            prune_threshold: Duration::from_secs(15 * 60),
            capacity_change_buffer: 1024,
        }
    }
}

/// Scheduler worker tunables (spec.md §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(
        rename = "dequeue_timeout_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub dequeue_timeout: Duration,

    #[serde(
        rename = "raft_sync_limit_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub raft_sync_limit: Duration,

    #[serde(
        rename = "fast_backoff_baseline_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub fast_backoff_baseline: Duration,

    #[serde(
        rename = "slow_backoff_baseline_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub slow_backoff_baseline: Duration,

    #[serde(
        rename = "slow_backoff_ceiling_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub slow_backoff_ceiling: Duration,

    #[serde(
        rename = "version_mismatch_backoff_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub version_mismatch_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(500),
            raft_sync_limit: Duration::from_secs(5),
            fast_backoff_baseline: Duration::from_millis(20),
            slow_backoff_baseline: Duration::from_millis(500),
            slow_backoff_ceiling: Duration::from_secs(10),
            version_mismatch_backoff: Duration::from_secs(30),
        }
    }
}

/// Core GC scheduler tunables (spec.md §4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(
        rename = "eval_gc_threshold_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub eval_gc_threshold: Duration,

    #[serde(
        rename = "node_gc_threshold_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub node_gc_threshold: Duration,

    #[serde(
        rename = "job_gc_threshold_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub job_gc_threshold: Duration,

    #[serde(
        rename = "deployment_gc_threshold_ms",
        serialize_with = "se_duration_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub deployment_gc_threshold: Duration,

    /// Inherited from the original 0.25MB / 36-byte-per-id derivation
    /// (spec.md §9 Open Question); not re-derived against a different log.
    pub max_ids_per_reap: usize,

    pub rekey_rate_limit_per_sec: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            eval_gc_threshold: Duration::from_secs(60 * 60),
            node_gc_threshold: Duration::from_secs(24 * 60 * 60),
            job_gc_threshold: Duration::from_secs(4 * 60 * 60),
            deployment_gc_threshold: Duration::from_secs(60 * 60),
            max_ids_per_reap: 7281,
            rekey_rate_limit_per_sec: 100,
        }
    }
}

/// Root configuration, matching the teacher's `WorkflowConfig` shape: a
/// single YAML-deserializable struct loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub blocked: BlockedEvalsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl SchedulerConfig {
    /// Load from a YAML file, falling back to defaults for anything absent.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SchedulerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load `.env`-style overrides (teacher's `dotenvy` pattern) then apply
    /// a config file if `SCHED_CONFIG` points at one, else defaults.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        match std::env::var("SCHED_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }
}
