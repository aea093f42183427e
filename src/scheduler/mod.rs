//! Narrow interface to the external batch scheduler.
//!
//! Admission and reconciliation only ever talk to a [`SchedulerClient`]; the
//! real implementation shells out to Slurm ([`SlurmClient`]) and tests plug in
//! an in-memory fake.

pub mod error;
pub mod parse;
pub mod slurm;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use error::SchedulerError;
pub use slurm::SlurmClient;

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code reported by the scheduler for a job it still knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCode {
    Running,
    Pending,
    /// Any other code (`CG`, `CF`, ...). Treated as "not present".
    Other(String),
}

impl StatusCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "R" => StatusCode::Running,
            "PD" => StatusCode::Pending,
            other => StatusCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Running => write!(f, "R"),
            StatusCode::Pending => write!(f, "PD"),
            StatusCode::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Submit and batched status query against an external scheduler.
#[allow(async_fn_in_trait)]
pub trait SchedulerClient {
    /// Submits the script at `script` and returns the assigned identifier.
    async fn submit(&self, script: &Path) -> Result<JobId, SchedulerError>;

    /// One query covering every id in `ids`. Ids missing from the returned map
    /// are not known to the scheduler.
    async fn query_statuses(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusCode>, SchedulerError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory scheduler used by admission and reconciliation tests.

    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{JobId, SchedulerClient, SchedulerError, StatusCode};

    #[derive(Default)]
    struct Inner {
        next_id: u64,
        reject_all: bool,
        rejected_scripts: Vec<String>,
        submitted: Vec<PathBuf>,
        statuses: BTreeMap<JobId, StatusCode>,
        query_calls: usize,
        queried: Vec<Vec<JobId>>,
        fail_queries: bool,
    }

    /// Fake scheduler: every accepted submission starts out pending.
    pub struct FakeScheduler {
        inner: Mutex<Inner>,
    }

    impl FakeScheduler {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    next_id: 100,
                    ..Default::default()
                }),
            }
        }

        pub fn rejecting() -> Self {
            let fake = Self::new();
            fake.inner.lock().unwrap().reject_all = true;
            fake
        }

        /// Rejects scripts whose file name contains `fragment`.
        pub fn reject_script(&self, fragment: &str) {
            self.inner
                .lock()
                .unwrap()
                .rejected_scripts
                .push(fragment.to_string());
        }

        pub fn fail_queries(&self, fail: bool) {
            self.inner.lock().unwrap().fail_queries = fail;
        }

        pub fn set_status(&self, id: JobId, code: &str) {
            self.inner
                .lock()
                .unwrap()
                .statuses
                .insert(id, StatusCode::from_code(code));
        }

        /// Makes the scheduler forget `id`, as if the job finished.
        pub fn finish(&self, id: JobId) {
            self.inner.lock().unwrap().statuses.remove(&id);
        }

        pub fn finish_all(&self) {
            self.inner.lock().unwrap().statuses.clear();
        }

        pub fn submitted(&self) -> Vec<PathBuf> {
            self.inner.lock().unwrap().submitted.clone()
        }

        pub fn query_calls(&self) -> usize {
            self.inner.lock().unwrap().query_calls
        }

        pub fn queried(&self) -> Vec<Vec<JobId>> {
            self.inner.lock().unwrap().queried.clone()
        }
    }

    impl SchedulerClient for FakeScheduler {
        async fn submit(&self, script: &Path) -> Result<JobId, SchedulerError> {
            let mut inner = self.inner.lock().unwrap();
            inner.submitted.push(script.to_path_buf());
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if inner.reject_all || inner.rejected_scripts.iter().any(|f| name.contains(f)) {
                return Err(SchedulerError::SubmitRejected {
                    script: script.to_path_buf(),
                    output: "sbatch: error: Batch job submission failed".into(),
                });
            }
            inner.next_id += 1;
            let id = JobId(inner.next_id);
            inner.statuses.insert(id, StatusCode::Pending);
            Ok(id)
        }

        async fn query_statuses(
            &self,
            ids: &[JobId],
        ) -> Result<HashMap<JobId, StatusCode>, SchedulerError> {
            let mut inner = self.inner.lock().unwrap();
            inner.query_calls += 1;
            inner.queried.push(ids.to_vec());
            if inner.fail_queries {
                return Err(SchedulerError::Timeout {
                    command: "squeue".into(),
                    secs: 1,
                });
            }
            Ok(ids
                .iter()
                .filter_map(|id| inner.statuses.get(id).map(|s| (*id, s.clone())))
                .collect())
        }
    }
}
