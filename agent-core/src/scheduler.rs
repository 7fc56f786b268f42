//! Autonomy scheduler (spec §4.8): a periodic, weighted-score task picker
//! that drives the agent's own premium requests without a human in the loop.
//!
//! The tick loop is spawned the way the teacher spawns its background
//! workers: `tokio::time::interval` driving a loop owned by a single task,
//! reading `Arc`-shared state rather than holding a lock across the tick.
//! Lock acquisition for a chosen task is itself the same optimistic
//! compare-and-swap used everywhere else in the core: the scheduler reads
//! the row, flips it to RUNNING, and writes it back — a lost race means
//! another tick (or a concurrent coordinator) already claimed it.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{
    balance::BalanceMonitor,
    clock::Clock,
    coordinator::RequestCoordinator,
    executor::PaymentExecutor,
    ledger::Ledger,
    models::{AutonomyTask, LedgerCategory, TaskStatus},
    repository::Repository,
    session::SessionRegistry,
};

/// Score formula from spec §4.8: freshness pressure times value, amortized
/// over cost. Tasks whose freshness window hasn't elapsed yet score zero.
pub fn score(task: &AutonomyTask, now_secs_since_last_success: Option<u64>) -> f64 {
    let Some(elapsed) = now_secs_since_last_success else {
        return f64::MAX; // never run: maximally eligible
    };
    if task.cost <= 0.0 {
        return 0.0;
    }
    let freshness = (elapsed as f64 / task.freshness_window_secs.max(1) as f64).min(1.0);
    freshness * task.value_score / task.cost
}

/// `min(baseBackoff * 2^(failureCount-1), maxBackoff)`, spec §4.8.
pub fn backoff_secs(base_backoff_secs: u64, failure_count: u32, max_backoff_secs: u64) -> u64 {
    if failure_count == 0 {
        return 0;
    }
    let exp = failure_count.saturating_sub(1).min(32);
    let scaled = base_backoff_secs.saturating_mul(1u64 << exp);
    scaled.min(max_backoff_secs)
}

pub struct Scheduler<C: Clock> {
    repo: Arc<dyn Repository>,
    coordinator: Arc<RequestCoordinator<C>>,
    executor: Arc<PaymentExecutor<C>>,
    sessions: Arc<SessionRegistry<C>>,
    ledger: Arc<Ledger<C>>,
    balance: Arc<BalanceMonitor<C>>,
    clock: Arc<C>,
    min_run_score: f64,
    max_backoff_secs: u64,
    scheduler_session_id: tokio::sync::Mutex<Option<String>>,
}

impl<C: Clock> Scheduler<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        coordinator: Arc<RequestCoordinator<C>>,
        executor: Arc<PaymentExecutor<C>>,
        sessions: Arc<SessionRegistry<C>>,
        ledger: Arc<Ledger<C>>,
        balance: Arc<BalanceMonitor<C>>,
        clock: Arc<C>,
        min_run_score: f64,
        max_backoff_secs: u64,
    ) -> Self {
        Self {
            repo,
            coordinator,
            executor,
            sessions,
            ledger,
            balance,
            clock,
            min_run_score,
            max_backoff_secs,
            scheduler_session_id: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn register_task(&self, task: AutonomyTask) -> anyhow::Result<AutonomyTask> {
        self.repo.upsert_task(task).await
    }

    /// One scheduler tick: picks the single best-scoring eligible task (if
    /// any), claims it, and runs it to completion. Skips entirely (no task
    /// claimed) while payments are paused (spec §4.8 step 1).
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        if self.balance.ensure_payments_active().await.is_err() {
            return;
        }
        let Some(task) = self.select_eligible().await else {
            return;
        };
        self.run_task(task).await;
    }

    async fn select_eligible(&self) -> Option<AutonomyTask> {
        let now = self.clock.now();
        let tasks = self.repo.list_tasks().await.ok()?;

        let mut best: Option<(f64, AutonomyTask)> = None;
        for task in tasks {
            // Eligible iff not currently RUNNING, unlocked, and its
            // next-eligible time has passed — a BACKOFF task becomes
            // eligible again once that window elapses (spec §4.8 step 2).
            if task.status == TaskStatus::Running || task.locked_at.is_some() {
                continue;
            }
            if now < task.next_eligible_at {
                continue;
            }
            let elapsed = task.last_success_at.map(|t| t.secs_until(now));
            let s = score(&task, elapsed);
            if s < self.min_run_score {
                continue;
            }
            let better = match &best {
                None => true,
                // Tie-break by endpoint name for determinism (spec §4.8).
                Some((best_score, best_task)) => {
                    s > *best_score || (s == *best_score && task.endpoint < best_task.endpoint)
                }
            };
            if better {
                best = Some((s, task));
            }
        }
        best.map(|(s, mut task)| {
            task.last_score = Some(s);
            task
        })
    }

    #[instrument(skip(self, task), fields(endpoint = %task.endpoint))]
    async fn run_task(&self, mut task: AutonomyTask) {
        let now = self.clock.now();
        task.status = TaskStatus::Running;
        task.locked_at = Some(now);
        task.last_run_at = Some(now);

        let claimed = match self.repo.update_task(task.clone()).await {
            Ok(Ok(claimed)) => claimed,
            Ok(Err(_conflict)) => {
                info!("lost the race to claim this task, another tick already has it");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to claim autonomy task");
                return;
            }
        };

        let outcome = self.execute_once(&claimed.endpoint).await;
        self.finish_task(claimed, outcome).await;
    }

    async fn execute_once(&self, endpoint: &str) -> Result<(), String> {
        let session_id = self.scheduler_session_id.lock().await.clone();
        let request = self
            .coordinator
            .request_or_advance(endpoint, None)
            .await
            .map_err(|e| e.to_string())?;
        self.executor
            .clone()
            .execute(&request.id, session_id.as_deref())
            .await
            .map_err(|e| e.to_string())?;
        self.coordinator
            .request_or_advance(endpoint, Some(&request.id))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn finish_task(&self, mut task: AutonomyTask, outcome: Result<(), String>) {
        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                task.status = TaskStatus::Idle;
                task.failure_count = 0;
                task.last_success_at = Some(now);
                task.last_error = None;
                task.next_eligible_at = now;
            }
            Err(error) => {
                task.failure_count += 1;
                let backoff = backoff_secs(task.base_backoff_secs, task.failure_count, self.max_backoff_secs);
                task.status = TaskStatus::Backoff;
                task.next_eligible_at = now.plus_secs(backoff);
                task.last_error = Some(error.clone());
                warn!(endpoint = %task.endpoint, backoff, %error, "autonomy task failed, backing off");
            }
        }
        task.locked_at = None;

        if let Err(e) = self.repo.update_task(task.clone()).await {
            warn!(error = %e, "failed to persist autonomy task outcome");
            return;
        }

        let _ = self
            .ledger
            .append(
                LedgerCategory::Autonomy,
                if task.failure_count == 0 { "task-succeeded" } else { "task-failed" },
                None,
                None,
                None,
                Some(serde_json::json!({
                    "endpoint": task.endpoint,
                    "score": task.last_score,
                    "failureCount": task.failure_count,
                })),
            )
            .await;
    }

    /// Lets the scheduler reuse a single long-lived session capability across
    /// ticks instead of acquiring a fresh signer each time (spec §4.8).
    pub async fn set_scheduler_session(&self, session_id: Option<String>) {
        *self.scheduler_session_id.lock().await = session_id;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_secs(10, 0, 900), 0);
        assert_eq!(backoff_secs(10, 1, 900), 10);
        assert_eq!(backoff_secs(10, 2, 900), 20);
        assert_eq!(backoff_secs(10, 3, 900), 40);
        assert_eq!(backoff_secs(10, 20, 900), 900);
    }

    #[test]
    fn never_run_task_scores_maximally() {
        let task = AutonomyTask {
            endpoint: "market".to_string(),
            value_score: 1.0,
            cost: 1.0,
            freshness_window_secs: 60,
            base_backoff_secs: 10,
            status: TaskStatus::Idle,
            last_run_at: None,
            last_success_at: None,
            failure_count: 0,
            next_eligible_at: crate::clock::TimestampMs::from_i64(0),
            locked_at: None,
            last_error: None,
            last_score: None,
            version: 0,
        };
        assert_eq!(score(&task, None), f64::MAX);
    }

    #[test]
    fn freshness_caps_score_at_full_value_over_cost() {
        let task = AutonomyTask {
            endpoint: "market".to_string(),
            value_score: 2.0,
            cost: 1.0,
            freshness_window_secs: 100,
            base_backoff_secs: 10,
            status: TaskStatus::Idle,
            last_run_at: None,
            last_success_at: None,
            failure_count: 0,
            next_eligible_at: crate::clock::TimestampMs::from_i64(0),
            locked_at: None,
            last_error: None,
            last_score: None,
            version: 0,
        };
        assert_eq!(score(&task, Some(200)), 2.0);
        assert_eq!(score(&task, Some(50)), 1.0);
    }
}
