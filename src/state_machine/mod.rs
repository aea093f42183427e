mod job;
mod state;

pub use job::{Job, JobOutcome, JobRecord, JobSpec, LifecyclePolicy};
pub use state::{Observation, State, Transition};

#[cfg(test)]
pub(crate) use job::tests::{scratch_job, scratch_spec};
#[cfg(test)]
pub(crate) use state::{Event, StateMachine};
