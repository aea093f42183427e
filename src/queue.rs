//! A named pool of jobs with a concurrency limit.

use std::collections::HashMap;

use crate::context::RunContext;
use crate::error::FailureKind;
use crate::regression::RegressionVerifier;
use crate::scheduler::{JobId, SchedulerClient, StatusCode};
use crate::state_machine::{Job, JobOutcome, Observation, State, Transition};

/// What one admission pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Admission {
    pub submitted: Vec<(String, JobId)>,
    pub refused: Vec<(String, String)>,
}

/// Jobs assigned to one scheduler queue, in enqueue order.
///
/// At most `limit` jobs are ever `Pending` or `Running` at once. Admission is
/// FIFO: the earliest-enqueued job still waiting for submission goes first.
#[derive(Debug)]
pub struct Queue {
    name: String,
    limit: usize,
    jobs: Vec<Job>,
}

impl Queue {
    pub fn new(name: &str, limit: usize) -> Self {
        Self {
            name: name.to_string(),
            limit,
            jobs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Takes effect at the next admission pass.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Jobs currently holding a slot.
    pub fn admitted_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.state.is_admitted()).count()
    }

    pub fn count_in(&self, state: State) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// Jobs not yet in a terminal state.
    pub fn unfinished_count(&self) -> usize {
        self.jobs.iter().filter(|j| !j.state.is_terminal()).count()
    }

    /// Ids worth asking the scheduler about.
    pub fn tracked_ids(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| !j.state.is_terminal())
            .filter_map(Job::id)
            .collect()
    }

    /// Appends `job` without trying to submit anything.
    pub fn hold(&mut self, job: Job) {
        self.jobs.push(job);
    }

    /// Appends `job` and runs an admission pass.
    pub async fn enqueue(
        &mut self,
        job: Job,
        client: &impl SchedulerClient,
        ctx: &RunContext,
    ) -> Admission {
        ctx.log(&format!(
            "Enqueue {} in queue {} (limit {})",
            job.unique_name, self.name, self.limit
        ));
        self.jobs.push(job);
        self.admit(client, ctx).await
    }

    /// Submits waiting jobs while free slots remain.
    ///
    /// Each attempt uses up a slot for this pass whether or not the scheduler
    /// accepts it. Refusals are logged and returned, never propagated.
    pub async fn admit(&mut self, client: &impl SchedulerClient, ctx: &RunContext) -> Admission {
        let mut slots = self.limit.saturating_sub(self.admitted_count());
        let mut admission = Admission::default();

        for job in self.jobs.iter_mut() {
            if slots == 0 {
                break;
            }
            if job.state != State::Created {
                continue;
            }
            slots -= 1;
            match job.submit(client).await {
                Ok(id) => {
                    tracing::info!(queue = %self.name, job = %job.unique_name, %id, "submitted");
                    ctx.log(&format!(
                        "Submitted {} as {id}, output {}",
                        job.unique_name,
                        job.output_path.display()
                    ));
                    admission.submitted.push((job.unique_name.clone(), id));
                }
                Err(err) => {
                    tracing::warn!(
                        kind = %FailureKind::Submission,
                        queue = %self.name,
                        job = %job.unique_name,
                        attempt = job.submit_attempts,
                        error = %err,
                        "submission failed"
                    );
                    ctx.log(&format!(
                        "Failure to submit {} (attempt {}): {err}",
                        job.unique_name, job.submit_attempts
                    ));
                    if job.state == State::SubmitFailed {
                        ctx.log(&format!("Giving up on {}", job.unique_name));
                    }
                    admission.refused.push((job.unique_name.clone(), err.to_string()));
                }
            }
        }
        admission
    }

    /// Applies one batched status result to every job, runs regression on
    /// jobs that just finished, then refills free slots.
    pub async fn reconcile(
        &mut self,
        statuses: &HashMap<JobId, StatusCode>,
        client: &impl SchedulerClient,
        verifier: &RegressionVerifier,
        ctx: &RunContext,
    ) -> Admission {
        for job in self.jobs.iter_mut() {
            let observed = Observation::from(job.id().and_then(|id| statuses.get(&id)));
            match job.update_status(observed) {
                Transition::Next(state) => {
                    tracing::debug!(queue = %self.name, job = %job.unique_name, %state, "state change");
                    ctx.log(&format!("{} is now {state}", job.unique_name));
                }
                Transition::Complete(JobOutcome::Finished) => {
                    tracing::info!(queue = %self.name, job = %job.unique_name, "finished");
                    ctx.log(&format!("{} done running", job.unique_name));
                    verifier.verify(job, ctx);
                }
                _ => {}
            }
        }
        self.admit(client, ctx).await
    }
}
