use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{Job, JobOutcome};
use crate::scheduler::{JobId, StatusCode};

/// Lifecycle states of a batch job.
///
/// `Created → Pending ⇄ Running → Done`, with `SubmitFailed` reached only
/// when a submission cap is configured and every attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Created,
    Pending,
    Running,
    SubmitFailed,
    Done,
}

impl State {
    /// Holds a scheduler slot.
    pub fn is_admitted(self) -> bool {
        matches!(self, State::Pending | State::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::SubmitFailed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Created => write!(f, "CREATED"),
            State::Pending => write!(f, "PENDING"),
            State::Running => write!(f, "RUNNING"),
            State::SubmitFailed => write!(f, "SUBMIT_FAILED"),
            State::Done => write!(f, "DONE"),
        }
    }
}

/// What one status query said about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Running,
    Pending,
    /// Not in the scheduler's answer, or reported with any other code.
    Absent,
}

impl From<Option<&StatusCode>> for Observation {
    fn from(code: Option<&StatusCode>) -> Self {
        match code {
            Some(StatusCode::Running) => Observation::Running,
            Some(StatusCode::Pending) => Observation::Pending,
            Some(StatusCode::Other(_)) | None => Observation::Absent,
        }
    }
}

/// Input driving a job from one state to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Submitted(JobId),
    SubmitRefused(String),
    Observed(Observation),
}

/// The result of applying an [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing changed.
    Unchanged,
    /// Moved to a new non-terminal state.
    Next(State),
    /// Submission failed; the job stays `Created` and will be tried again.
    Retry { attempt: u32, reason: String },
    /// The job reached a terminal state for the first time.
    Complete(JobOutcome),
}

/// Drives a [`Job`] through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Apply `event` to `job` and return what happened.
    ///
    /// - Terminal jobs ignore every event, so observing a finished job again
    ///   never completes it twice.
    /// - A job without an id can only be submitted; observations leave it alone.
    /// - A submitted job finishes after `absent_polls_before_done` consecutive
    ///   absent observations; any sighting resets the count.
    pub fn next(job: &mut Job, event: Event) -> Transition {
        if job.state.is_terminal() {
            return Transition::Unchanged;
        }

        let transition = match (job.state, event) {
            (State::Created, Event::Submitted(id)) => {
                job.assign_id(id);
                Transition::Next(State::Pending)
            }
            (State::Created, Event::SubmitRefused(reason)) => {
                job.submit_attempts += 1;
                let exhausted = job
                    .policy
                    .max_submit_attempts
                    .is_some_and(|max| job.submit_attempts >= max);
                if !exhausted {
                    Transition::Retry {
                        attempt: job.submit_attempts,
                        reason,
                    }
                } else {
                    Transition::Complete(JobOutcome::GaveUp(reason))
                }
            }
            (State::Created, Event::Observed(_)) => Transition::Unchanged,
            (State::Pending | State::Running, Event::Observed(obs)) => {
                Self::observe(job, obs)
            }
            // An id is never replaced and a running job cannot be refused.
            (_, Event::Submitted(_) | Event::SubmitRefused(_)) => Transition::Unchanged,
            (State::SubmitFailed | State::Done, _) => Transition::Unchanged,
        };

        match &transition {
            Transition::Next(next_state) => {
                job.state_history.push(job.state);
                job.state = *next_state;
                job.touch();
            }
            Transition::Retry { reason, .. } => {
                job.last_error = Some(reason.clone());
                job.touch();
            }
            Transition::Complete(outcome) => {
                job.state_history.push(job.state);
                job.state = match outcome {
                    JobOutcome::Finished => State::Done,
                    JobOutcome::GaveUp(reason) => {
                        job.last_error = Some(reason.clone());
                        State::SubmitFailed
                    }
                };
                job.touch();
            }
            Transition::Unchanged => {}
        }

        transition
    }

    fn observe(job: &mut Job, obs: Observation) -> Transition {
        let seen = match obs {
            Observation::Running => State::Running,
            Observation::Pending => State::Pending,
            Observation::Absent => {
                job.absent_polls += 1;
                return if job.absent_polls >= job.policy.absent_polls_before_done {
                    Transition::Complete(JobOutcome::Finished)
                } else {
                    Transition::Unchanged
                };
            }
        };
        job.absent_polls = 0;
        if seen == job.state {
            Transition::Unchanged
        } else {
            Transition::Next(seen)
        }
    }
}
