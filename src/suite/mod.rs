//! Expands suites into jobs and runs them through the queue registry.

pub mod parser;

pub use parser::{parse_file, SuiteSpec};

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;

use anyhow::Context;
use regex::Regex;

use crate::context::RunContext;
use crate::error::SpawnError;
use crate::registry::{QueueRegistry, Tick, WaitOutcome};
use crate::regression::{self, ComparisonReport, RegressionSink, SharedSink};
use crate::scheduler::SchedulerClient;
use crate::state_machine::{Job, JobRecord, JobSpec, LifecyclePolicy};

pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Margin used for baseline comparison when the directive names none.
pub const DEFAULT_MARGIN: f64 = 0.10;

/// Queue used by suites without a `queue` option.
pub const DEFAULT_QUEUE: &str = "normal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Submit every job and wait for all of them.
    Submit,
    /// Write scripts only.
    DryRun,
    /// Submit nothing; run regression on output left by an earlier run.
    RegressOnly,
}

/// One point of a suite's job matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixPoint {
    pub app: String,
    pub nodes: u32,
    pub ppn: u32,
    pub threads: i32,
}

impl MatrixPoint {
    pub fn unique_name(&self, suite: &str) -> String {
        format!("{suite}-{}-{}-{}-{}", self.app, self.nodes, self.ppn, self.threads)
    }
}

#[derive(Debug)]
pub struct SuiteReport {
    pub suite: String,
    pub jobs: usize,
    /// `None` unless jobs were submitted.
    pub outcome: Option<WaitOutcome>,
    pub comparison: Option<ComparisonReport>,
    pub records: Vec<JobRecord>,
}

/// Jobs of `suite` in submission order: per application, threads vary
/// slowest and node count fastest.
pub fn matrix(suite: &SuiteSpec) -> Result<Vec<MatrixPoint>, SpawnError> {
    let apps = expand_apps(&suite.dir, &suite.apps)?;
    let mut seen = HashSet::new();
    let mut points = Vec::new();
    for app in &apps {
        for &threads in &suite.threads {
            for &ppn in &suite.ppn {
                for &nodes in &suite.nodes {
                    let point = MatrixPoint {
                        app: app.clone(),
                        nodes,
                        ppn,
                        threads,
                    };
                    let name = point.unique_name(&suite.name);
                    if !seen.insert(name.clone()) {
                        return Err(SpawnError::DuplicateJobName(name));
                    }
                    points.push(point);
                }
            }
        }
    }
    Ok(points)
}

/// Replaces each `*` pattern with the sorted file names in `dir` it matches.
pub fn expand_apps(dir: &Path, patterns: &[String]) -> Result<Vec<String>, SpawnError> {
    let mut apps = Vec::new();
    for pattern in patterns {
        if !pattern.contains('*') {
            apps.push(pattern.clone());
            continue;
        }
        let re = wildcard(pattern)?;
        let mut matched: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| re.is_match(name))
            .collect();
        matched.sort();
        if matched.is_empty() {
            tracing::warn!(pattern = %pattern, dir = %dir.display(), "application wildcard matches nothing");
        }
        tracing::debug!(pattern = %pattern, apps = ?matched, "expanded application wildcard");
        apps.extend(matched);
    }
    Ok(apps)
}

fn wildcard(pattern: &str) -> Result<Regex, SpawnError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| SpawnError::Config(format!("bad application pattern <<{pattern}>>: {e}")))
}

/// Spec for one matrix point, with the suite's options applied.
pub fn job_spec(
    suite: &SuiteSpec,
    point: &MatrixPoint,
    ctx: &RunContext,
    sink: Option<&SharedSink>,
    policy: LifecyclePolicy,
) -> JobSpec {
    let options = &suite.options;
    let mut spec = JobSpec::new(
        options.get("queue").unwrap_or(DEFAULT_QUEUE),
        &point.app,
        ctx.script_dir(),
    );
    spec.unique_name = Some(point.unique_name(&suite.name));
    spec.program_dir = suite.dir.clone();
    spec.runner = suite.runner.clone();
    spec.nodes = point.nodes;
    spec.ppn = point.ppn;
    spec.threads = point.threads;
    spec.account = options.get("account").unwrap_or_default().to_string();
    if let Some(time) = options.get("time") {
        spec.time = time.to_string();
    }
    spec.modules = options.get("modules").map(str::to_string);
    spec.sbatch = options.sbatch.clone();
    spec.env = options.env.clone();
    spec.output_dir = Some(ctx.output_dir().to_path_buf());
    spec.regression = suite.regression.clone();
    spec.sink = sink.cloned();
    spec.macros = suite.macros.clone();
    spec.policy = policy;
    spec
}

/// Output root of `suite`, from its `outputdir` option.
pub fn output_root(suite: &SuiteSpec) -> Result<&Path, SpawnError> {
    suite
        .options
        .get("outputdir")
        .filter(|dir| !dir.trim().is_empty())
        .map(Path::new)
        .ok_or(SpawnError::MissingOutputDir)
}

/// Creates, hands over and (in [`Mode::Submit`]) waits for every job of
/// `suite`, then compares against `comparedir` when one is configured.
///
/// Every queue the suite uses must already be registered.
pub async fn run_suite(
    suite: &SuiteSpec,
    registry: &mut QueueRegistry,
    client: &impl SchedulerClient,
    policy: LifecyclePolicy,
    mode: Mode,
    on_tick: impl FnMut(&Tick),
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<SuiteReport> {
    let queue = suite.options.get("queue").unwrap_or(DEFAULT_QUEUE);
    if registry.queue(queue).is_none() {
        return Err(SpawnError::UnknownQueue(queue.to_string()).into());
    }
    let ctx = RunContext::create(output_root(suite)?)?;
    ctx.log(&format!(
        "Test suite {} run at {}",
        suite.name,
        suite.macros.value_of("date")
    ));
    ctx.log(&format!("{suite:#?}"));

    let points = matrix(suite)?;
    let sink = match &suite.regression {
        Some(_) => {
            let path = ctx.root().join(format!("regression-{}.txt", suite.name));
            let sink = RegressionSink::shared(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            Some(sink)
        }
        None => None,
    };

    for (count, point) in points.iter().enumerate() {
        ctx.log(&format!(
            "{}: suite=<<{}>> benchmark=<<{}>> N={} ppn={} threads={}",
            count + 1,
            suite.name,
            point.app,
            point.nodes,
            point.ppn,
            point.threads
        ));
        let mut job = Job::create(job_spec(suite, point, &ctx, sink.as_ref(), policy))?;
        ctx.log(&format!("Job script: {}", job.script_path.display()));
        match mode {
            Mode::Submit => {
                registry.enqueue(job, client, &ctx).await?;
            }
            Mode::DryRun => registry.hold(job, &ctx)?,
            Mode::RegressOnly => {
                registry.verifier().verify(&mut job, &ctx);
                registry.hold(job, &ctx)?;
            }
        }
    }

    let outcome = match mode {
        Mode::Submit => Some(registry.wait_until_done(client, &ctx, on_tick, shutdown).await),
        Mode::DryRun | Mode::RegressOnly => {
            ctx.log("Done, since this was only a test");
            None
        }
    };

    let names: HashSet<String> = points.iter().map(|p| p.unique_name(&suite.name)).collect();
    let records: Vec<JobRecord> = registry
        .jobs()
        .filter(|job| names.contains(&job.unique_name))
        .map(JobRecord::from_job)
        .collect();
    let summary = ctx.root().join(SUMMARY_FILE_NAME);
    write_summary(&summary, &records).with_context(|| format!("writing {}", summary.display()))?;

    if let Some(WaitOutcome::Interrupted { .. }) = outcome {
        return Ok(SuiteReport {
            suite: suite.name.clone(),
            jobs: points.len(),
            outcome,
            comparison: None,
            records,
        });
    }

    let comparison = match (suite.options.get("comparedir"), &suite.regression) {
        (Some(compare_dir), Some(directive)) if mode != Mode::DryRun => {
            ctx.log("All jobs finished, only regression comparison left to do");
            let report = compare_with_baseline(
                &Path::new(compare_dir).join("regression"),
                ctx.regression_dir(),
                directive.margin.unwrap_or(DEFAULT_MARGIN),
            )?;
            let path = ctx.root().join(format!("regression_compare-{}.txt", suite.name));
            report
                .write_to(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            ctx.log(&format!(
                "Comparison written to {}: {} major violations",
                path.display(),
                report.major_violations().count()
            ));
            Some(report)
        }
        _ => None,
    };

    Ok(SuiteReport {
        suite: suite.name.clone(),
        jobs: points.len(),
        outcome,
        comparison,
        records,
    })
}

/// Writes `records` as pretty-printed JSON.
pub fn write_summary(path: &Path, records: &[JobRecord]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Compares the result files of two regression directories.
pub fn compare_with_baseline(
    baseline_dir: &Path,
    current_dir: &Path,
    tolerance: f64,
) -> anyhow::Result<ComparisonReport> {
    let baseline = regression::load_result_set(baseline_dir)
        .with_context(|| format!("reading baseline results in {}", baseline_dir.display()))?;
    let current = regression::load_result_set(current_dir)
        .with_context(|| format!("reading results in {}", current_dir.display()))?;
    Ok(regression::compare(&baseline, &current, tolerance))
}
