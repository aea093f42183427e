//! Directory of every [`Queue`] in a run and the polling loop that drives them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::context::RunContext;
use crate::error::{FailureKind, SpawnError};
use crate::queue::{Admission, Queue};
use crate::regression::RegressionVerifier;
use crate::scheduler::{JobId, SchedulerClient};
use crate::state_machine::{Job, State};

/// Counts after one reconciliation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    pub unfinished: usize,
    pub running: usize,
    pub pending: usize,
    /// Whether the scheduler was queried this tick.
    pub queried: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed { ticks: usize },
    Interrupted { unfinished: usize },
}

/// All queues of a run.
///
/// Single writer: every mutation goes through `&mut self`, so job state
/// transitions are never applied concurrently.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: BTreeMap<String, Queue>,
    poll_interval: Duration,
    verifier: RegressionVerifier,
}

impl QueueRegistry {
    pub fn new(poll_interval: Duration, verifier: RegressionVerifier) -> Self {
        Self {
            queues: BTreeMap::new(),
            poll_interval,
            verifier,
        }
    }

    pub fn verifier(&self) -> &RegressionVerifier {
        &self.verifier
    }

    /// Registers `name`, or updates its limit if it already exists.
    pub fn add_queue(&mut self, name: &str, limit: usize) {
        match self.queues.get_mut(name) {
            Some(queue) => queue.set_limit(limit),
            None => {
                self.queues.insert(name.to_string(), Queue::new(name, limit));
            }
        }
        tracing::debug!(queue = name, limit, "queue registered");
    }

    pub fn set_limit(&mut self, name: &str, limit: usize) -> Result<(), SpawnError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| SpawnError::UnknownQueue(name.to_string()))?
            .set_limit(limit);
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.queues.values().flat_map(|q| q.jobs().iter())
    }

    pub fn unfinished_count(&self) -> usize {
        self.queues.values().map(Queue::unfinished_count).sum()
    }

    fn queue_for(&mut self, job: &Job) -> Result<&mut Queue, SpawnError> {
        self.queues
            .get_mut(&job.queue)
            .ok_or_else(|| SpawnError::UnknownQueue(job.queue.clone()))
    }

    /// Hands `job` to the queue it names and lets that queue admit work.
    pub async fn enqueue(
        &mut self,
        job: Job,
        client: &impl SchedulerClient,
        ctx: &RunContext,
    ) -> Result<Admission, SpawnError> {
        let queue = self.queue_for(&job)?;
        Ok(queue.enqueue(job, client, ctx).await)
    }

    /// Records `job` in its queue without ever submitting it.
    ///
    /// Held jobs are never admitted by this registry; a run that holds jobs
    /// must not call [`Self::wait_until_done`].
    pub fn hold(&mut self, job: Job, ctx: &RunContext) -> Result<(), SpawnError> {
        ctx.log(&format!("test run: no actual submit of {}", job.unique_name));
        self.queue_for(&job)?.hold(job);
        Ok(())
    }

    /// One reconciliation tick: a single batched status query for every
    /// tracked id, then `reconcile` on each queue.
    ///
    /// The query is skipped when no job has an id. A failed query counts as
    /// an empty answer, so every tracked job is absent for this tick.
    pub async fn tick(&mut self, client: &impl SchedulerClient, ctx: &RunContext) -> Tick {
        let ids: Vec<JobId> = self.queues.values().flat_map(Queue::tracked_ids).collect();

        let queried = !ids.is_empty();
        let statuses = if queried {
            match client.query_statuses(&ids).await {
                Ok(statuses) => statuses,
                Err(err) => {
                    tracing::warn!(kind = %FailureKind::Query, error = %err, "status query failed");
                    ctx.log(&format!("Status query failed: {err}"));
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        for queue in self.queues.values_mut() {
            queue.reconcile(&statuses, client, &self.verifier, ctx).await;
        }

        let tick = Tick {
            unfinished: self.unfinished_count(),
            running: self.queues.values().map(|q| q.count_in(State::Running)).sum(),
            pending: self.queues.values().map(|q| q.count_in(State::Pending)).sum(),
            queried,
        };
        tracing::info!(
            unfinished = tick.unfinished,
            running = tick.running,
            pending = tick.pending,
            "poll"
        );
        ctx.log(&format!(
            "Jobs unfinished: {}, running: {}, pending in queue: {}",
            tick.unfinished, tick.running, tick.pending
        ));
        tick
    }

    /// Polls until every job is finished or `shutdown` resolves.
    ///
    /// `shutdown` is only checked while sleeping between ticks, so a
    /// submission or query in flight always completes first. Calling this
    /// again after an interruption resumes where it stopped.
    pub async fn wait_until_done(
        &mut self,
        client: &impl SchedulerClient,
        ctx: &RunContext,
        mut on_tick: impl FnMut(&Tick),
        shutdown: impl Future<Output = ()>,
    ) -> WaitOutcome {
        tokio::pin!(shutdown);
        let mut ticks = 0;
        loop {
            let tick = self.tick(client, ctx).await;
            ticks += 1;
            on_tick(&tick);
            if tick.unfinished == 0 {
                ctx.log("Done all jobs");
                return WaitOutcome::Completed { ticks };
            }
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = &mut shutdown => {
                    ctx.log(&format!("Interrupted with {} unfinished jobs", tick.unfinished));
                    return WaitOutcome::Interrupted { unfinished: tick.unfinished };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::fake::FakeScheduler;
    use crate::state_machine::{scratch_spec, LifecyclePolicy};
    use tempfile::TempDir;

    fn job(dir: &TempDir, name: &str, queue: &str, policy: LifecyclePolicy) -> Job {
        let mut spec = scratch_spec(dir, name);
        spec.queue = queue.to_string();
        spec.policy = policy;
        Job::create(spec).unwrap()
    }

    fn quick() -> LifecyclePolicy {
        LifecyclePolicy {
            max_submit_attempts: Some(3),
            absent_polls_before_done: 1,
        }
    }

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Duration::from_millis(1), RegressionVerifier::default())
    }

    #[test]
    fn add_queue_is_idempotent() {
        let mut reg = registry();
        reg.add_queue("normal", 2);
        reg.add_queue("normal", 5);
        assert_eq!(reg.queues().count(), 1);
        assert_eq!(reg.queue("normal").unwrap().limit(), 5);
    }

    #[test]
    fn set_limit_requires_existing_queue() {
        let mut reg = registry();
        assert!(matches!(
            reg.set_limit("gpu", 1),
            Err(SpawnError::UnknownQueue(_))
        ));
        reg.add_queue("gpu", 1);
        reg.set_limit("gpu", 4).unwrap();
        assert_eq!(reg.queue("gpu").unwrap().limit(), 4);
    }

    #[tokio::test]
    async fn enqueue_unknown_queue_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let mut reg = registry();
        reg.add_queue("normal", 1);
        let err = reg
            .enqueue(job(&dir, "x", "nowhere", quick()), &FakeScheduler::new(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown queue: nowhere");
    }

    #[tokio::test]
    async fn wait_runs_every_job_to_done_with_one_query_per_tick() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::new();
        let mut reg = registry();
        reg.add_queue("normal", 2);
        reg.add_queue("dev", 1);

        for i in 0..5 {
            let queue = if i % 2 == 0 { "normal" } else { "dev" };
            reg.enqueue(job(&dir, &format!("j{i}"), queue, quick()), &client, &ctx)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let outcome = reg
            .wait_until_done(
                &client,
                &ctx,
                |tick| {
                    seen.push(*tick);
                    // Everything the scheduler knows about finishes between polls.
                    client.finish_all();
                },
                std::future::pending(),
            )
            .await;

        let WaitOutcome::Completed { ticks } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(ticks, seen.len());
        let queried_ticks = seen.iter().filter(|t| t.queried).count();
        assert_eq!(client.query_calls(), queried_ticks);
        assert!(client.query_calls() <= ticks);
        assert!(client.queried().iter().all(|ids| !ids.is_empty() && ids.len() <= 3));
        assert!(reg.jobs().all(|j| j.state == State::Done));
        assert_eq!(reg.unfinished_count(), 0);
    }

    #[tokio::test]
    async fn query_skipped_when_nothing_was_submitted() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::rejecting();
        let policy = LifecyclePolicy {
            max_submit_attempts: Some(2),
            absent_polls_before_done: 1,
        };
        let mut reg = registry();
        reg.add_queue("normal", 1);
        reg.enqueue(job(&dir, "a", "normal", policy), &client, &ctx).await.unwrap();
        reg.enqueue(job(&dir, "b", "normal", policy), &client, &ctx).await.unwrap();

        let outcome = reg
            .wait_until_done(&client, &ctx, |_| {}, std::future::pending())
            .await;
        assert_eq!(outcome, WaitOutcome::Completed { ticks: 2 });
        assert_eq!(client.query_calls(), 0);
        assert!(reg.jobs().all(|j| j.state == State::SubmitFailed));
    }

    #[tokio::test]
    async fn refused_head_job_blocks_a_full_queue() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::rejecting();
        let mut reg = registry();
        reg.add_queue("normal", 1);
        for name in ["A", "B", "C"] {
            reg.enqueue(job(&dir, name, "normal", LifecyclePolicy::default()), &client, &ctx)
                .await
                .unwrap();
        }

        let outcome = reg
            .wait_until_done(
                &client,
                &ctx,
                |_| {},
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(outcome, WaitOutcome::Interrupted { unfinished: 3 });
        let attempted: Vec<String> = client
            .submitted()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert!(attempted.len() > 3);
        assert!(attempted.iter().all(|name| name == "A.script"));
        assert!(reg.jobs().all(|j| j.state == State::Created));
        assert_eq!(client.query_calls(), 0);
    }

    #[tokio::test]
    async fn failed_query_counts_as_absence() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::new();
        let policy = LifecyclePolicy {
            max_submit_attempts: Some(3),
            absent_polls_before_done: 2,
        };
        let mut reg = registry();
        reg.add_queue("normal", 1);
        reg.enqueue(job(&dir, "a", "normal", policy), &client, &ctx).await.unwrap();

        client.fail_queries(true);
        let tick = reg.tick(&client, &ctx).await;
        // One missed poll is not enough to call the job finished.
        assert_eq!(tick.unfinished, 1);
        assert_eq!(reg.jobs().next().unwrap().state, State::Pending);

        client.fail_queries(false);
        let tick = reg.tick(&client, &ctx).await;
        assert_eq!(tick.pending, 1);
        assert_eq!(reg.jobs().next().unwrap().absent_polls, 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_and_wait_can_resume() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::new();
        let mut reg = QueueRegistry::new(Duration::from_secs(3600), RegressionVerifier::default());
        reg.add_queue("normal", 1);
        reg.enqueue(job(&dir, "a", "normal", quick()), &client, &ctx).await.unwrap();

        let outcome = reg
            .wait_until_done(&client, &ctx, |_| {}, std::future::ready(()))
            .await;
        assert_eq!(outcome, WaitOutcome::Interrupted { unfinished: 1 });

        client.finish_all();
        let outcome = reg
            .wait_until_done(&client, &ctx, |_| {}, std::future::pending())
            .await;
        assert_eq!(outcome, WaitOutcome::Completed { ticks: 1 });
    }

    #[tokio::test]
    async fn hold_records_without_submitting() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::create(dir.path().join("run")).unwrap();
        let client = FakeScheduler::new();
        let mut reg = registry();
        reg.add_queue("normal", 4);
        reg.hold(job(&dir, "a", "normal", quick()), &ctx).unwrap();
        assert!(matches!(
            reg.hold(job(&dir, "b", "gpu", quick()), &ctx),
            Err(SpawnError::UnknownQueue(_))
        ));

        assert!(client.submitted().is_empty());
        let held: Vec<&Job> = reg.jobs().collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].state, State::Created);
    }
}
