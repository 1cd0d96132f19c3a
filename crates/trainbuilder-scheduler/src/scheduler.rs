//! Stage scheduler - drives jobs through the pipeline one stage at a time.
//!
//! Every tick walks the configured rules in order. For each rule at most one
//! job is claimed out of the rule's entry state, processed inline, and moved
//! to the exit state, so each stage has at most one job in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trainbuilder_config::SchedulerSettings;
use trainbuilder_core::processor::StageProcessor;
use trainbuilder_core::{Error, Job, JobId, JobState, Result};
use trainbuilder_db::{DbError, DbResult, JobStore};

/// One pipeline stage: entry state, in-flight state, exit state, processor.
#[derive(Clone)]
pub struct StageRule {
    pub from: JobState,
    pub in_flight: JobState,
    pub to: JobState,
    pub processor: Arc<dyn StageProcessor>,
}

impl StageRule {
    /// Create a rule, checking that the three states are consecutive and
    /// that the middle one is an in-flight state.
    pub fn new(
        from: JobState,
        in_flight: JobState,
        to: JobState,
        processor: Arc<dyn StageProcessor>,
    ) -> Result<Self> {
        if !in_flight.is_in_flight() {
            return Err(Error::InvalidInput(format!(
                "{} is not an in-flight state",
                in_flight
            )));
        }
        if !from.can_transition_to(in_flight) {
            return Err(Error::InvalidTransition {
                from,
                to: in_flight,
            });
        }
        if !in_flight.can_transition_to(to) || to == JobState::Failed {
            return Err(Error::InvalidTransition { from: in_flight, to });
        }
        Ok(Self {
            from,
            in_flight,
            to,
            processor,
        })
    }

    pub fn name(&self) -> &'static str {
        self.processor.name()
    }
}

impl std::fmt::Debug for StageRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRule")
            .field("name", &self.name())
            .field("from", &self.from)
            .field("in_flight", &self.in_flight)
            .field("to", &self.to)
            .finish()
    }
}

/// Bounded retry with exponential backoff, applied while a job is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total processor attempts before the job is failed. At least 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub backoff: Duration,
}

impl RetryPolicy {
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(Self::MAX_BACKOFF)
            .min(Self::MAX_BACKOFF)
    }
}

impl From<&SchedulerSettings> for RetryPolicy {
    fn from(settings: &SchedulerSettings) -> Self {
        Self::new(settings.max_attempts, settings.retry_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// What a rule did during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// No job was waiting in the rule's entry state.
    Idle,
    /// A job was processed and moved to the exit state.
    Advanced { job_id: JobId, attempts: u32 },
    /// A job exhausted its attempts and was moved to `Failed`.
    Failed { job_id: JobId, error: String },
    /// The store rejected a claim or a state change. When a job had already
    /// been claimed, it was moved to `Failed` if the store allowed it.
    StoreError { job_id: Option<JobId>, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    pub rule: &'static str,
    pub outcome: StageOutcome,
}

/// Result of a single scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rules: Vec<RuleReport>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.rules.iter().all(|r| r.outcome == StageOutcome::Idle)
    }
}

/// A state change on a claimed job.
#[derive(Debug, Clone, Copy)]
enum StoreOp<'a> {
    Advance(JobState),
    RecordAttempt(&'a str),
    Fail(&'a str),
}

/// The pipeline control loop.
pub struct StageScheduler {
    store: Arc<dyn JobStore>,
    rules: Vec<StageRule>,
    retry: RetryPolicy,
    tick: Duration,
    wake: Arc<Notify>,
}

impl StageScheduler {
    pub fn new(store: Arc<dyn JobStore>, rules: Vec<StageRule>) -> Self {
        Self {
            store,
            rules,
            retry: RetryPolicy::default(),
            tick: Duration::from_secs(1),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Share a wake-up signal, so submitters can trigger a tick early.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn rules(&self) -> &[StageRule] {
        &self.rules
    }

    /// Run every rule once, in configured order.
    ///
    /// A failing rule never stops the rules after it; its trouble is
    /// reported in its outcome.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for rule in &self.rules {
            let outcome = self.run_rule(rule).await;
            report.rules.push(RuleReport {
                rule: rule.name(),
                outcome,
            });
        }
        report
    }

    async fn run_rule(&self, rule: &StageRule) -> StageOutcome {
        let mut job = match self.store.claim(rule.from, rule.in_flight).await {
            Ok(Some(job)) => job,
            Ok(None) => return StageOutcome::Idle,
            Err(e) => {
                warn!(stage = rule.name(), error = %e, "Claim failed");
                return StageOutcome::StoreError {
                    job_id: None,
                    error: e.to_string(),
                };
            }
        };
        info!(job_id = %job.id, stage = rule.name(), train = %job.canonical_name, "Job claimed");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match rule.processor.process(&job).await {
                Ok(()) => {
                    if let Err(e) = self.persist(&mut job, StoreOp::Advance(rule.to)).await {
                        return self.abandon(rule, &mut job, e).await;
                    }
                    info!(job_id = %job.id, stage = rule.name(), state = %job.state, "Stage completed");
                    return StageOutcome::Advanced {
                        job_id: job.id,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        job_id = %job.id,
                        stage = rule.name(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %message,
                        "Stage attempt failed"
                    );
                    if let Err(e) = self
                        .persist(&mut job, StoreOp::RecordAttempt(&message))
                        .await
                    {
                        return self.abandon(rule, &mut job, e).await;
                    }

                    if attempt >= self.retry.max_attempts {
                        if let Err(e) = self.persist(&mut job, StoreOp::Fail(&message)).await {
                            error!(job_id = %job.id, error = %e, "Job left in flight until restart");
                            return StageOutcome::StoreError {
                                job_id: Some(job.id),
                                error: e.to_string(),
                            };
                        }
                        error!(job_id = %job.id, stage = rule.name(), error = %message, "Job failed");
                        return StageOutcome::Failed {
                            job_id: job.id,
                            error: message,
                        };
                    }
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                }
            }
        }
    }

    /// Apply `op` to a claimed job, retrying store errors under the retry
    /// policy. Illegal transitions are never retried.
    async fn persist(&self, job: &mut Job, op: StoreOp<'_>) -> DbResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match op {
                StoreOp::Advance(to) => self.store.advance(job, to).await,
                StoreOp::RecordAttempt(message) => {
                    self.store.record_failed_attempt(job, message).await
                }
                StoreOp::Fail(message) => self.store.fail(job, message).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e @ DbError::InvalidTransition { .. }) => return Err(e),
                Err(e) if attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    warn!(job_id = %job.id, ?op, attempt, error = %e, "Store update failed, retrying");
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                }
            }
        }
    }

    /// Give up on a job whose state could not be stored and try to move it
    /// to `Failed`. Should that fail too, restart recovery picks it up.
    async fn abandon(&self, rule: &StageRule, job: &mut Job, cause: DbError) -> StageOutcome {
        let message = format!("{} stage could not store job state: {}", rule.name(), cause);
        error!(job_id = %job.id, stage = rule.name(), error = %cause, "Store update failed");

        if let Err(e) = self.persist(job, StoreOp::Fail(&message)).await {
            error!(job_id = %job.id, error = %e, "Job left in flight until restart");
        }
        StageOutcome::StoreError {
            job_id: Some(job.id),
            error: message,
        }
    }

    /// Tick on the configured interval, or earlier when woken, until
    /// `shutdown` resolves. A tick in progress always runs to completion.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(tick = ?self.tick, rules = self.rules.len(), "Starting stage scheduler");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            let report = self.tick().await;
            if !report.is_idle() {
                debug!(?report, "Tick finished");
            }
        }

        info!("Stage scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyProcessor, FlakyStore, RecordingProcessor};
    use std::path::Path;
    use trainbuilder_db::MemoryJobStore;

    async fn saved_job(store: &MemoryJobStore, name: &str) -> Job {
        let mut job = store
            .create_job(name, Path::new("/tmp/jobs"))
            .await
            .unwrap();
        store.advance(&mut job, JobState::ArchiveSaved).await.unwrap();
        job
    }

    fn rules(
        augment: Arc<dyn StageProcessor>,
        publish: Arc<dyn StageProcessor>,
    ) -> Vec<StageRule> {
        vec![
            StageRule::new(
                JobState::ArchiveSaved,
                JobState::AugmentInProgress,
                JobState::AugmentDone,
                augment,
            )
            .unwrap(),
            StageRule::new(
                JobState::AugmentDone,
                JobState::PublishInProgress,
                JobState::PublishDone,
                publish,
            )
            .unwrap(),
        ]
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_rule_validation() {
        let p: Arc<dyn StageProcessor> = Arc::new(RecordingProcessor::new("p"));

        assert!(
            StageRule::new(
                JobState::ArchiveSaved,
                JobState::AugmentInProgress,
                JobState::AugmentDone,
                p.clone()
            )
            .is_ok()
        );
        // Skips a state
        assert!(
            StageRule::new(
                JobState::ArchiveSaved,
                JobState::PublishInProgress,
                JobState::PublishDone,
                p.clone()
            )
            .is_err()
        );
        // Middle state is not in flight
        assert!(
            StageRule::new(
                JobState::Submitted,
                JobState::ArchiveSaved,
                JobState::AugmentInProgress,
                p.clone()
            )
            .is_err()
        );
        // Exit into Failed is not a stage
        assert!(
            StageRule::new(
                JobState::AugmentDone,
                JobState::PublishInProgress,
                JobState::Failed,
                p
            )
            .is_err()
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(retry.delay_after(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after(3), Duration::from_millis(400));
        assert_eq!(retry.delay_after(40), RetryPolicy::MAX_BACKOFF);
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_tick_on_empty_store_is_noop() {
        let store = Arc::new(MemoryJobStore::new());
        let augment = Arc::new(RecordingProcessor::new("augment"));
        let publish = Arc::new(RecordingProcessor::new("publish"));
        let scheduler = StageScheduler::new(store.clone(), rules(augment.clone(), publish.clone()));

        let report = scheduler.tick().await;

        assert!(report.is_idle());
        assert_eq!(report.rules.len(), 2);
        assert!(augment.seen().is_empty());
        assert!(publish.seen().is_empty());
    }

    #[tokio::test]
    async fn test_tick_advances_only_oldest_job_per_stage() {
        let store = Arc::new(MemoryJobStore::new());
        let first = saved_job(&store, "first.tar").await;
        let second = saved_job(&store, "second.tar").await;
        let augment = Arc::new(RecordingProcessor::new("augment"));
        let mut augment_only = rules(augment.clone(), Arc::new(RecordingProcessor::new("publish")));
        augment_only.truncate(1);
        let scheduler = StageScheduler::new(store.clone(), augment_only);

        let report = scheduler.tick().await;

        assert_eq!(
            report.rules,
            vec![RuleReport {
                rule: "augment",
                outcome: StageOutcome::Advanced {
                    job_id: first.id,
                    attempts: 1
                }
            }]
        );
        assert_eq!(augment.seen(), vec![first.id]);
        assert_eq!(store.get(first.id).await.unwrap().state, JobState::AugmentDone);
        assert_eq!(store.get(second.id).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_later_rule_picks_up_job_in_same_tick() {
        let store = Arc::new(MemoryJobStore::new());
        let first = saved_job(&store, "first.tar").await;
        let second = saved_job(&store, "second.tar").await;
        let augment = Arc::new(RecordingProcessor::new("augment"));
        let publish = Arc::new(RecordingProcessor::new("publish"));
        let scheduler = StageScheduler::new(store.clone(), rules(augment.clone(), publish.clone()));

        scheduler.tick().await;

        assert_eq!(augment.seen(), vec![first.id]);
        assert_eq!(publish.seen(), vec![first.id]);
        assert_eq!(store.get(first.id).await.unwrap().state, JobState::PublishDone);
        assert_eq!(
            store.get(second.id).await.unwrap().state,
            JobState::ArchiveSaved
        );
    }

    #[tokio::test]
    async fn test_processor_sees_in_flight_state() {
        let store = Arc::new(MemoryJobStore::new());
        saved_job(&store, "a.tar").await;
        let augment = Arc::new(RecordingProcessor::new("augment"));
        let publish = Arc::new(RecordingProcessor::new("publish"));
        let scheduler = StageScheduler::new(store.clone(), rules(augment.clone(), publish.clone()));

        scheduler.tick().await;

        assert_eq!(augment.states(), vec![JobState::AugmentInProgress]);
        assert_eq!(publish.states(), vec![JobState::PublishInProgress]);
    }

    #[tokio::test]
    async fn test_state_trace_is_monotonic() {
        let store = Arc::new(MemoryJobStore::new());
        let mut jobs = Vec::new();
        for i in 0..4 {
            jobs.push(saved_job(&store, &format!("t{}.tar", i)).await);
        }
        let scheduler = StageScheduler::new(
            store.clone(),
            rules(
                Arc::new(RecordingProcessor::new("augment")),
                Arc::new(RecordingProcessor::new("publish")),
            ),
        );

        let mut traces: Vec<Vec<JobState>> = jobs.iter().map(|j| vec![j.state]).collect();
        for _ in 0..8 {
            scheduler.tick().await;
            for (job, trace) in jobs.iter().zip(traces.iter_mut()) {
                let state = store.get(job.id).await.unwrap().state;
                if trace.last() != Some(&state) {
                    trace.push(state);
                }
            }
        }

        for trace in traces {
            for pair in trace.windows(2) {
                let (from, to) = (pair[0].position().unwrap(), pair[1].position().unwrap());
                assert!(to > from, "reversal in {:?}", trace);
            }
            assert_eq!(trace.last(), Some(&JobState::PublishDone));
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = Arc::new(MemoryJobStore::new());
        let job = saved_job(&store, "a.tar").await;
        let augment = Arc::new(FlakyProcessor::new("augment", 2));
        let publish = Arc::new(RecordingProcessor::new("publish"));
        let scheduler = StageScheduler::new(store.clone(), rules(augment.clone(), publish))
            .with_retry(fast_retry(3));

        let report = scheduler.tick().await;

        assert_eq!(
            report.rules[0].outcome,
            StageOutcome::Advanced {
                job_id: job.id,
                attempts: 3
            }
        );
        assert_eq!(augment.calls(), 3);
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::PublishDone);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job_with_detail() {
        let store = Arc::new(MemoryJobStore::new());
        let job = saved_job(&store, "a.tar").await;
        let augment = Arc::new(FlakyProcessor::new("augment", u32::MAX));
        let publish = Arc::new(RecordingProcessor::new("publish"));
        let scheduler = StageScheduler::new(store.clone(), rules(augment.clone(), publish.clone()))
            .with_retry(fast_retry(3));

        let report = scheduler.tick().await;

        assert!(matches!(
            report.rules[0].outcome,
            StageOutcome::Failed { job_id, .. } if job_id == job.id
        ));
        assert_eq!(report.rules[1].outcome, StageOutcome::Idle);
        assert_eq!(augment.calls(), 3);
        assert!(publish.seen().is_empty());

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.error.unwrap().contains("attempt 3"));

        // Failed jobs are never picked up again
        assert!(scheduler.tick().await.is_idle());
        assert_eq!(augment.calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_next_job() {
        let store = Arc::new(MemoryJobStore::new());
        let doomed = saved_job(&store, "doomed.tar").await;
        let healthy = saved_job(&store, "healthy.tar").await;
        let augment = Arc::new(FlakyProcessor::failing_for("augment", doomed.id));
        let scheduler = StageScheduler::new(
            store.clone(),
            rules(augment, Arc::new(RecordingProcessor::new("publish"))),
        )
        .with_retry(fast_retry(1));

        scheduler.tick().await;
        scheduler.tick().await;

        assert_eq!(store.get(doomed.id).await.unwrap().state, JobState::Failed);
        assert_eq!(
            store.get(healthy.id).await.unwrap().state,
            JobState::PublishDone
        );
    }

    #[tokio::test]
    async fn test_run_wakes_on_notify_and_stops_on_shutdown() {
        let store = Arc::new(MemoryJobStore::new());
        let wake = Arc::new(Notify::new());
        let scheduler = Arc::new(
            StageScheduler::new(
                store.clone(),
                rules(
                    Arc::new(RecordingProcessor::new("augment")),
                    Arc::new(RecordingProcessor::new("publish")),
                ),
            )
            // Long enough that only the wake-up can drive the job
            .with_tick(Duration::from_secs(3600))
            .with_wake(wake.clone()),
        );

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        // Let the immediate first interval tick pass
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = saved_job(&store, "woken.tar").await;
        wake.notify_one();

        let mut state = JobState::ArchiveSaved;
        for _ in 0..100 {
            state = store.get(job.id).await.unwrap().state;
            if state == JobState::PublishDone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, JobState::PublishDone);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_blip_on_advance_is_retried() {
        let store = Arc::new(FlakyStore::failing_advance(JobState::AugmentDone, 1));
        let job = saved_job(store.inner(), "a.tar").await;
        let scheduler = StageScheduler::new(
            store.clone(),
            rules(
                Arc::new(RecordingProcessor::new("augment")),
                Arc::new(RecordingProcessor::new("publish")),
            ),
        )
        .with_retry(fast_retry(3));

        let report = scheduler.tick().await;

        assert_eq!(
            report.rules[0].outcome,
            StageOutcome::Advanced {
                job_id: job.id,
                attempts: 1
            }
        );
        assert_eq!(store.get(job.id).await.unwrap().state, JobState::PublishDone);
    }

    #[tokio::test]
    async fn test_store_failure_fails_job_instead_of_stranding_it() {
        let store = Arc::new(FlakyStore::failing_advance(JobState::AugmentDone, u32::MAX));
        let stuck = saved_job(store.inner(), "stuck.tar").await;
        let scheduler = StageScheduler::new(
            store.clone(),
            rules(
                Arc::new(RecordingProcessor::new("augment")),
                Arc::new(RecordingProcessor::new("publish")),
            ),
        )
        .with_retry(fast_retry(2));

        let report = scheduler.tick().await;

        // The tick carries on with the remaining rules
        assert_eq!(report.rules.len(), 2);
        assert!(matches!(
            report.rules[0].outcome,
            StageOutcome::StoreError { job_id: Some(id), .. } if id == stuck.id
        ));
        assert_eq!(report.rules[1].outcome, StageOutcome::Idle);

        let stored = store.get(stuck.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.error.unwrap().contains("could not store job state"));
        assert!(
            store
                .list_by_state(JobState::AugmentInProgress)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
