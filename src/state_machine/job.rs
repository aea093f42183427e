use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Event, State, StateMachine, Transition};
use crate::error::SpawnError;
use crate::macros::MacroTable;
use crate::regression::{RegressionDirective, SharedSink};
use crate::scheduler::{JobId, SchedulerClient, SchedulerError};
use crate::script;

/// How a job left the active part of its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// The scheduler stopped reporting it: the job ran and finished.
    Finished,
    /// Every submission attempt was refused.
    GaveUp(String),
}

/// Limits applied while a job moves through the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Submission attempts before the job is given up as `SubmitFailed`.
    /// `None` keeps a refused job in `Created` for as long as the run lasts.
    pub max_submit_attempts: Option<u32>,
    /// Consecutive polls a submitted job must be missing before it is `Done`.
    pub absent_polls_before_done: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_submit_attempts: None,
            absent_polls_before_done: 2,
        }
    }
}

/// Everything needed to build one [`Job`].
///
/// Structural fields are typed; anything else a script or label may want to
/// mention travels in `macros`.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub unique_name: Option<String>,
    pub queue: String,
    pub program_name: String,
    pub program_dir: PathBuf,
    /// Prefix placed in front of the program, e.g. `ibrun `.
    pub runner: String,
    pub nodes: u32,
    pub ppn: u32,
    /// `0` leaves threading alone, a negative value derives it from the allocation.
    pub threads: i32,
    pub account: String,
    pub time: String,
    pub modules: Option<String>,
    pub sbatch: Vec<String>,
    pub env: Vec<(String, String)>,
    pub script_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub regression: Option<RegressionDirective>,
    pub sink: Option<SharedSink>,
    pub macros: MacroTable,
    pub policy: LifecyclePolicy,
}

impl JobSpec {
    /// Spec with the defaults the suite driver starts from.
    pub fn new(queue: &str, program_name: &str, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            unique_name: None,
            queue: queue.to_string(),
            program_name: program_name.to_string(),
            program_dir: PathBuf::from("."),
            runner: String::new(),
            nodes: 1,
            ppn: 1,
            threads: 0,
            account: String::new(),
            time: "01:00:00".to_string(),
            modules: None,
            sbatch: Vec::new(),
            env: Vec::new(),
            script_dir: script_dir.into(),
            output_dir: None,
            regression: None,
            sink: None,
            macros: MacroTable::new(),
            policy: LifecyclePolicy::default(),
        }
    }

    /// `N<nodes>-ppn<ppn>` plus `-t<threads>` (or `-tx` when derived).
    pub fn nodespec(&self) -> String {
        let threads = match self.threads {
            t if t > 0 => format!("-t{t}"),
            t if t < 0 => "-tx".to_string(),
            _ => String::new(),
        };
        format!("N{}-ppn{}{threads}", self.nodes, self.ppn)
    }
}

/// A single schedulable unit.
#[derive(Debug)]
pub struct Job {
    pub unique_name: String,
    pub queue: String,
    pub program_name: String,
    pub nodespec: String,
    id: Option<JobId>,
    pub state: State,
    pub state_history: Vec<State>,
    pub script_path: PathBuf,
    pub output_path: PathBuf,
    pub regression: Option<RegressionDirective>,
    pub sink: Option<SharedSink>,
    pub macros: MacroTable,
    pub policy: LifecyclePolicy,
    pub submit_attempts: u32,
    pub absent_polls: u32,
    pub last_error: Option<String>,
    pub regression_result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds the job and writes its script to `spec.script_dir`.
    ///
    /// The script text is generated once here, from the fully macro-resolved
    /// template, and never regenerated.
    pub fn create(spec: JobSpec) -> Result<Self, SpawnError> {
        let unique_name = spec
            .unique_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or(SpawnError::MissingUniqueName)?;
        let output_dir = spec.output_dir.clone().ok_or(SpawnError::MissingOutputDir)?;

        let mut macros = spec.macros.clone();
        macros.insert_raw("unique_name", unique_name.clone());
        macros.insert_raw("program", spec.program_name.clone());
        macros.insert_raw("nodes", spec.nodes.to_string());
        macros.insert_raw("ppn", spec.ppn.to_string());
        macros.insert_raw("threads", spec.threads.to_string());
        macros.insert_raw("cores", (u64::from(spec.nodes) * u64::from(spec.ppn)).to_string());

        let output_path = output_dir.join(format!("{unique_name}.out"));
        let template = script::render(&spec, &unique_name, &output_path);
        let script_text = macros.resolve(&template)?;

        let script_path = spec.script_dir.join(format!("{unique_name}.script"));
        write_script(&spec.script_dir, &script_path, &script_text)?;
        tracing::debug!(job = %unique_name, script = %script_path.display(), "wrote job script");

        let now = Utc::now();
        Ok(Self {
            nodespec: spec.nodespec(),
            unique_name,
            queue: spec.queue,
            program_name: spec.program_name,
            id: None,
            state: State::Created,
            state_history: Vec::new(),
            script_path,
            output_path,
            regression: spec.regression,
            sink: spec.sink,
            macros,
            policy: spec.policy,
            submit_attempts: 0,
            absent_polls: 0,
            last_error: None,
            regression_result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// Label used for this job's line in the suite result file.
    pub fn result_label(&self) -> String {
        format!("{}-{}", self.program_name, self.nodespec)
    }

    /// Hands the script to the scheduler.
    ///
    /// On success the job becomes `Pending` and keeps the returned id. On
    /// failure the job stays `Created` (or becomes `SubmitFailed` once its
    /// attempts run out) and the error is returned to the caller.
    pub async fn submit(
        &mut self,
        client: &impl SchedulerClient,
    ) -> Result<JobId, SchedulerError> {
        match client.submit(&self.script_path).await {
            Ok(id) => {
                StateMachine::next(self, Event::Submitted(id));
                Ok(id)
            }
            Err(err) => {
                StateMachine::next(self, Event::SubmitRefused(err.to_string()));
                Err(err)
            }
        }
    }

    /// Applies one status observation; see [`StateMachine::next`].
    pub fn update_status(&mut self, observation: super::Observation) -> Transition {
        StateMachine::next(self, Event::Observed(observation))
    }

    pub(super) fn assign_id(&mut self, id: JobId) {
        if self.id.is_some() {
            return;
        }
        self.id = Some(id);
        let path = self.output_path.display().to_string();
        if path.contains("%j") {
            self.output_path = PathBuf::from(path.replace("%j", &id.to_string()));
        }
    }

    pub(super) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn write_script(dir: &Path, path: &Path, text: &str) -> Result<(), SpawnError> {
    if !dir.is_dir() {
        return Err(SpawnError::ScriptWrite {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory {} does not exist", dir.display()),
            ),
        });
    }
    std::fs::write(path, format!("{text}\n")).map_err(|source| SpawnError::ScriptWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Serializable summary of a job, written to `summary.json` at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub unique_name: String,
    pub queue: String,
    pub job_id: Option<JobId>,
    pub state: State,
    pub state_transitions: Vec<State>,
    pub submit_attempts: u32,
    pub script: PathBuf,
    pub output: PathBuf,
    pub regression_result: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            unique_name: job.unique_name.clone(),
            queue: job.queue.clone(),
            job_id: job.id,
            state: job.state,
            state_transitions: transitions,
            submit_attempts: job.submit_attempts,
            script: job.script_path.clone(),
            output: job.output_path.clone(),
            regression_result: job.regression_result.clone(),
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scheduler::fake::FakeScheduler;
    use crate::state_machine::Observation;
    use tempfile::TempDir;

    /// Spec rooted in a fresh temporary directory with `scripts/` and `output/`.
    pub(crate) fn scratch_spec(dir: &TempDir, name: &str) -> JobSpec {
        let scripts = dir.path().join("scripts");
        let output = dir.path().join("output");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        let mut spec = JobSpec::new("normal", "bench", scripts);
        spec.unique_name = Some(name.to_string());
        spec.output_dir = Some(output);
        spec.account = "A-ccount".into();
        spec.macros = MacroTable::isolated();
        spec
    }

    pub(crate) fn scratch_job(name: &str, policy: LifecyclePolicy) -> (TempDir, Job) {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, name);
        spec.policy = policy;
        let job = Job::create(spec).unwrap();
        (dir, job)
    }

    #[test]
    fn job_creation_defaults() {
        let (_dir, job) = scratch_job("bench-1-4-0", LifecyclePolicy::default());
        assert_eq!(job.state, State::Created);
        assert_eq!(job.id(), None);
        assert_eq!(job.submit_attempts, 0);
        assert!(job.state_history.is_empty());
        assert!(job.script_path.ends_with("bench-1-4-0.script"));
        assert!(job.output_path.ends_with("bench-1-4-0.out"));
    }

    #[test]
    fn create_writes_script_once() {
        let (_dir, job) = scratch_job("written", LifecyclePolicy::default());
        let on_disk = std::fs::read_to_string(&job.script_path).unwrap();
        assert!(on_disk.starts_with("#!/bin/bash"));
        assert!(on_disk.trim_end().ends_with("$program"));
        assert!(on_disk.contains("#SBATCH -J written"));
    }

    #[test]
    fn missing_unique_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "x");
        spec.unique_name = None;
        let err = Job::create(spec).unwrap_err();
        assert_eq!(err.to_string(), "missing unique name");
    }

    #[test]
    fn missing_output_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "x");
        spec.output_dir = None;
        assert!(matches!(
            Job::create(spec).unwrap_err(),
            SpawnError::MissingOutputDir
        ));
    }

    #[test]
    fn missing_script_dir_is_script_write_error() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "x");
        spec.script_dir = dir.path().join("not-there");
        let err = Job::create(spec).unwrap_err();
        assert!(matches!(err, SpawnError::ScriptWrite { .. }));
    }

    #[test]
    fn job_macros_reach_the_script() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "macro-job");
        spec.nodes = 2;
        spec.ppn = 8;
        spec.sbatch = vec!["--comment=%[unique_name]-%[cores]".into()];
        let job = Job::create(spec).unwrap();
        let on_disk = std::fs::read_to_string(&job.script_path).unwrap();
        assert!(on_disk.contains("#SBATCH --comment=macro-job-16"));
        assert_eq!(job.macros.get("cores"), Some("16"));
    }

    #[test]
    fn core_count_does_not_overflow() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "huge");
        spec.nodes = 70_000;
        spec.ppn = 70_000;
        let job = Job::create(spec).unwrap();
        assert_eq!(job.macros.value_of("cores"), "4900000000");
    }

    #[test]
    fn nodespec_formats_threads() {
        let dir = TempDir::new().unwrap();
        let mut spec = scratch_spec(&dir, "n");
        spec.nodes = 4;
        spec.ppn = 2;
        assert_eq!(spec.nodespec(), "N4-ppn2");
        spec.threads = 6;
        assert_eq!(spec.nodespec(), "N4-ppn2-t6");
        spec.threads = -1;
        assert_eq!(spec.nodespec(), "N4-ppn2-tx");
    }

    #[tokio::test]
    async fn submit_success_records_id() {
        let (_dir, mut job) = scratch_job("ok", LifecyclePolicy::default());
        let client = FakeScheduler::new();
        let id = job.submit(&client).await.unwrap();
        assert_eq!(job.id(), Some(id));
        assert_eq!(job.state, State::Pending);
        assert_eq!(client.submitted(), vec![job.script_path.clone()]);
    }

    #[tokio::test]
    async fn submit_failure_keeps_job_created() {
        let (_dir, mut job) = scratch_job("bad", LifecyclePolicy::default());
        let client = FakeScheduler::rejecting();
        let err = job.submit(&client).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SubmitRejected { .. }));
        assert_eq!(job.state, State::Created);
        assert_eq!(job.id(), None);
        assert_eq!(job.submit_attempts, 1);
    }

    #[test]
    fn job_id_placeholder_in_output_path() {
        let (_dir, mut job) = scratch_job("pct", LifecyclePolicy::default());
        job.output_path = job.output_path.with_file_name("pct.out%j");
        StateMachine::next(&mut job, Event::Submitted(JobId(77)));
        assert!(job.output_path.ends_with("pct.out77"));
    }

    #[test]
    fn update_status_before_submit_is_noop() {
        let (_dir, mut job) = scratch_job("idle", LifecyclePolicy::default());
        assert_eq!(job.update_status(Observation::Absent), Transition::Unchanged);
        assert_eq!(job.state, State::Created);
    }

    #[test]
    fn job_record_from_job() {
        let (_dir, mut job) = scratch_job("rec", LifecyclePolicy::default());
        StateMachine::next(&mut job, Event::Submitted(JobId(5)));
        let record = JobRecord::from_job(&job);
        assert_eq!(record.unique_name, "rec");
        assert_eq!(record.job_id, Some(JobId(5)));
        assert_eq!(record.state_transitions, vec![State::Created, State::Pending]);

        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, State::Pending);
    }
}
