//! The evaluation broker (spec.md §4.D): a leased, priority, namespace-aware
//! work queue with per-job serialization, nack redelivery, and
//! delivery-limit quarantine.

mod heap;

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::eval::{EvalId, Evaluation, SchedulerType, Token, WrappedEvaluation};
use heap::HeapEntry;

type JobKey = (String, String);

struct UnackedEntry {
    wrapped: WrappedEvaluation,
    token: Token,
    delivery_count: u32,
    nack_timer: Option<JoinHandle<()>>,
}

struct BrokerState {
    enabled: bool,
    heaps: HashMap<SchedulerType, BinaryHeap<HeapEntry>>,
    unacked: HashMap<EvalId, UnackedEntry>,
    waiting: HashMap<EvalId, JoinHandle<()>>,
    blocked: HashMap<JobKey, VecDeque<WrappedEvaluation>>,
    failed: BinaryHeap<HeapEntry>,
    /// Delivery counts survive a single eval across redelivery — the
    /// ready heap only carries the eval itself, so the count has to live
    /// here rather than in the (transient) heap entry.
    delivery_counts: HashMap<EvalId, u32>,
    /// Pending nack-backoff re-enqueue timers, so disabling the broker can
    /// cancel them the same as every other timer (spec.md §4.D Failure
    /// semantics "cancels every timer").
    backoff_timers: HashMap<EvalId, JoinHandle<()>>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            enabled: false,
            heaps: HashMap::new(),
            unacked: HashMap::new(),
            waiting: HashMap::new(),
            blocked: HashMap::new(),
            failed: BinaryHeap::new(),
            delivery_counts: HashMap::new(),
            backoff_timers: HashMap::new(),
        }
    }

    fn flush(&mut self) {
        for (_, handle) in self.waiting.drain() {
            handle.abort();
        }
        for (_, entry) in self.unacked.drain() {
            if let Some(h) = entry.nack_timer {
                h.abort();
            }
        }
        for (_, handle) in self.backoff_timers.drain() {
            handle.abort();
        }
        self.heaps.clear();
        self.blocked.clear();
        self.failed.clear();
        self.delivery_counts.clear();
    }

    /// Push a sibling-free eval straight into its type's ready heap, or
    /// behind an already-live sibling in `blocked` — the at-most-one-per-job
    /// enforcement point (spec.md §4.D Enqueue algorithm).
    fn place_or_block(&mut self, eval: Evaluation) {
        let key = eval.job_key();
        let sibling_live = self.unacked.values().any(|u| u.wrapped.eval.job_key() == key)
            || self
                .heaps
                .values()
                .any(|h| h.iter().any(|e| e.0.eval.job_key() == key));
        if sibling_live {
            self.blocked.entry(key).or_default().push_back(WrappedEvaluation::new(eval));
        } else {
            self.heaps
                .entry(eval.r#type)
                .or_default()
                .push(HeapEntry(WrappedEvaluation::new(eval)));
        }
    }
}

/// Live counts for the stats/telemetry tap (spec.md §4.K).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BrokerStats {
    pub ready: usize,
    pub unacked: usize,
    pub waiting: usize,
    pub blocked: usize,
    pub failed: usize,
}

/// A leased priority queue of evaluations. Cloning an `EvalBroker` shares
/// the same underlying state (it is an `Arc` handle), matching the
/// long-lived singleton the leadership gate enables/disables.
#[derive(Clone)]
pub struct EvalBroker {
    state: Arc<Mutex<BrokerState>>,
    ready_signal: Arc<Notify>,
    config: BrokerConfig,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
            ready_signal: Arc::new(Notify::new()),
            config,
        }
    }

    /// Enables or disables the broker. Disabling flushes all in-memory
    /// state and cancels every timer; re-enabling starts from empty
    /// state — durable recovery flows through state-store re-population,
    /// not through this component (spec.md §4.D Failure semantics).
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        if !enabled {
            state.flush();
        }
        state.enabled = enabled;
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.lock().await;
        BrokerStats {
            ready: state.heaps.values().map(|h| h.len()).sum(),
            unacked: state.unacked.len(),
            waiting: state.waiting.len(),
            blocked: state.blocked.values().map(|q| q.len()).sum(),
            failed: state.failed.len(),
        }
    }

    /// `Enqueue(eval)` — no-op if disabled (spec.md §4.D contract).
    #[instrument(skip(self, eval), fields(eval_id = %eval.id, job_id = %eval.job_id))]
    pub async fn enqueue(&self, eval: Evaluation) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        self.enqueue_locked(&mut state, eval);
        self.ready_signal.notify_waiters();
    }

    fn enqueue_locked(&self, state: &mut BrokerState, eval: Evaluation) {
        let now = Utc::now();
        if eval.is_immediately_ready(now) {
            state.place_or_block(eval);
            return;
        }

        let delay = wait_delay(&eval, now);
        let id = eval.id;
        let state_arc = self.state.clone();
        let signal = self.ready_signal.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state_arc.lock().await;
            if state.waiting.remove(&id).is_some() {
                state
                    .heaps
                    .entry(eval.r#type)
                    .or_default()
                    .push(HeapEntry(WrappedEvaluation::new(eval)));
                signal.notify_waiters();
            }
        });
        state.waiting.insert(id, handle);
    }

    /// `EnqueueAll(map eval→token)` — a non-empty token marks the eval as
    /// currently outstanding: it is appended behind the live lease in
    /// `blocked`, not placed in `ready` (spec.md §4.D).
    #[instrument(skip(self, batch))]
    pub async fn enqueue_all(&self, batch: Vec<(Evaluation, Option<Token>)>) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        for (eval, token) in batch {
            match token {
                Some(t) => {
                    let key = eval.job_key();
                    state
                        .blocked
                        .entry(key)
                        .or_default()
                        .push_back(WrappedEvaluation::with_token(eval, t));
                }
                None => self.enqueue_locked(&mut state, eval),
            }
        }
        self.ready_signal.notify_waiters();
    }

    /// `Dequeue(schedTypes, timeout)` — selects across accepted types with
    /// randomized round-robin fairness on contention; `timeout = ZERO`
    /// blocks until an eval is enqueued.
    #[instrument(skip(self, sched_types))]
    pub async fn dequeue(
        &self,
        sched_types: &[SchedulerType],
        timeout: Duration,
    ) -> Option<(Evaluation, Token)> {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };

        loop {
            if let Some(result) = self.try_dequeue(sched_types).await {
                return Some(result);
            }

            let notified = self.ready_signal.notified();
            match deadline {
                None => notified.await,
                Some(d) => {
                    let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_dequeue(&self, sched_types: &[SchedulerType]) -> Option<(Evaluation, Token)> {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return None;
        }

        let mut order: Vec<SchedulerType> = sched_types.to_vec();
        order.shuffle(&mut rand::thread_rng());

        for ty in order {
            if let Some(heap) = state.heaps.get_mut(&ty) {
                if let Some(HeapEntry(wrapped)) = heap.pop() {
                    let token = Uuid::new_v4();
                    let eval = wrapped.eval;
                    let id = eval.id;
                    let delivery_count = {
                        let counter = state.delivery_counts.entry(id).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    let nack_timer =
                        self.arm_nack_timer(id, token, self.config.nack_timeout);
                    state.unacked.insert(
                        id,
                        UnackedEntry {
                            wrapped: WrappedEvaluation::with_token(eval.clone(), token),
                            token,
                            delivery_count,
                            nack_timer: Some(nack_timer),
                        },
                    );
                    return Some((eval, token));
                }
            }
        }
        None
    }

    fn arm_nack_timer(&self, id: EvalId, token: Token, after: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            broker.auto_nack(id, token).await;
        })
    }

    async fn auto_nack(&self, id: EvalId, token: Token) {
        let _ = self.nack(id, token).await;
    }

    /// `Ack(evalID, token)` — removes from outstanding; promotes a blocked
    /// sibling if one is queued.
    #[instrument(skip(self))]
    pub async fn ack(&self, id: EvalId, token: Token) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state.unacked.remove(&id).ok_or(BrokerError::NotOutstanding(id))?;
        if entry.token != token {
            state.unacked.insert(id, entry);
            return Err(BrokerError::TokenMismatch(id));
        }
        if let Some(h) = entry.nack_timer {
            h.abort();
        }
        state.delivery_counts.remove(&id);

        let key = entry.wrapped.eval.job_key();
        let (promoted, now_empty) = match state.blocked.get_mut(&key) {
            Some(queue) => {
                let next = queue.pop_front();
                (next, queue.is_empty())
            }
            None => (None, false),
        };
        if now_empty {
            state.blocked.remove(&key);
        }
        if let Some(next) = promoted {
            {
                match next.token {
                    Some(existing_token) => {
                        let eval_id = next.eval.id;
                        let nack_timer =
                            self.arm_nack_timer(eval_id, existing_token, self.config.nack_timeout);
                        state.unacked.insert(
                            eval_id,
                            UnackedEntry {
                                wrapped: next,
                                token: existing_token,
                                delivery_count: 1,
                                nack_timer: Some(nack_timer),
                            },
                        );
                    }
                    None => {
                        let ty = next.eval.r#type;
                        state.heaps.entry(ty).or_default().push(HeapEntry(next));
                    }
                }
                self.ready_signal.notify_waiters();
            }
        }
        Ok(())
    }

    /// `Nack(evalID, token)` — schedules re-enqueue after backoff;
    /// increments the delivery count; quarantines into `failedQueue` once
    /// `deliveryLimit` is reached.
    #[instrument(skip(self))]
    pub async fn nack(&self, id: EvalId, token: Token) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state.unacked.remove(&id).ok_or(BrokerError::NotOutstanding(id))?;
        if entry.token != token {
            state.unacked.insert(id, entry);
            return Err(BrokerError::TokenMismatch(id));
        }
        if let Some(h) = entry.nack_timer {
            h.abort();
        }

        // Nacking drops any re-queued copy waiting behind this lease — the
        // original owner will produce a fresh one (spec.md §4.D).
        let key = entry.wrapped.eval.job_key();
        let now_empty = match state.blocked.get_mut(&key) {
            Some(queue) => {
                queue.retain(|w| w.eval.id != id);
                queue.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.blocked.remove(&key);
        }

        let delivery_count = entry.delivery_count;
        let mut eval = entry.wrapped.eval;
        eval.modify_index += 1;

        if delivery_count >= self.config.delivery_limit {
            state.failed.push(HeapEntry(WrappedEvaluation::new(eval)));
            self.ready_signal.notify_waiters();
            return Ok(());
        }

        let delay = if delivery_count <= 1 {
            self.config.initial_nack_delay
        } else {
            self.config.subsequent_nack_delay
        };

        let state_arc = self.state.clone();
        let signal = self.ready_signal.clone();
        let ty = eval.r#type;
        let backoff_id = id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state_arc.lock().await;
            if state.backoff_timers.remove(&backoff_id).is_none() {
                // Removed by a concurrent `flush()` — the broker was
                // disabled while this timer was in flight; drop the eval.
                return;
            }
            state.heaps.entry(ty).or_default().push(HeapEntry(WrappedEvaluation::new(eval)));
            signal.notify_waiters();
        });
        state.backoff_timers.insert(id, handle);
        Ok(())
    }

    /// Dequeue from the synthetic `failedQueue` (evals that exhausted the
    /// delivery limit), for a dedicated failed-eval handler.
    #[instrument(skip(self))]
    pub async fn dequeue_failed(&self, timeout: Duration) -> Option<(Evaluation, Token)> {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(HeapEntry(wrapped)) = state.failed.pop() {
                    let token = Uuid::new_v4();
                    let eval = wrapped.eval;
                    let id = eval.id;
                    let nack_timer = self.arm_nack_timer(id, token, self.config.nack_timeout);
                    state.unacked.insert(
                        id,
                        UnackedEntry {
                            wrapped: WrappedEvaluation::with_token(eval.clone(), token),
                            token,
                            delivery_count: self.config.delivery_limit,
                            nack_timer: Some(nack_timer),
                        },
                    );
                    return Some((eval, token));
                }
            }
            let notified = self.ready_signal.notified();
            match deadline {
                None => notified.await,
                Some(d) => {
                    let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub async fn outstanding(&self, id: EvalId) -> Option<Token> {
        let state = self.state.lock().await;
        state.unacked.get(&id).map(|e| e.token)
    }

    /// `OutstandingReset(id, token)` — resets the nack timer without
    /// acking or nacking.
    pub async fn outstanding_reset(&self, id: EvalId, token: Token) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state.unacked.get_mut(&id).ok_or(BrokerError::NotOutstanding(id))?;
        if entry.token != token {
            return Err(BrokerError::TokenMismatch(id));
        }
        if let Some(h) = entry.nack_timer.take() {
            h.abort();
        }
        entry.nack_timer = Some(self.arm_nack_timer(id, token, self.config.nack_timeout));
        Ok(())
    }

    /// Suspends the nack timer while the scheduler is still working
    /// (e.g. during a slow plan submission).
    pub async fn pause_nack_timeout(&self, id: EvalId, token: Token) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state.unacked.get_mut(&id).ok_or(BrokerError::NotOutstanding(id))?;
        if entry.token != token {
            return Err(BrokerError::TokenMismatch(id));
        }
        if let Some(h) = entry.nack_timer.take() {
            h.abort();
        }
        Ok(())
    }

    pub async fn resume_nack_timeout(&self, id: EvalId, token: Token) -> Result<(), BrokerError> {
        self.outstanding_reset(id, token).await
    }
}

fn wait_delay(eval: &Evaluation, now: chrono::DateTime<Utc>) -> Duration {
    let wait = eval.wait.unwrap_or(Duration::ZERO);
    let until_delay = eval
        .wait_until
        .map(|t| (t - now).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(Duration::ZERO);
    wait.max(until_delay)
}
