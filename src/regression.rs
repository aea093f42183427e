//! Output-based regression checks.
//!
//! A [`RegressionDirective`] says how to pull one comparable value out of a
//! job's output. When a job finishes, [`RegressionVerifier::verify`] writes
//! that value (or an explicit error marker) to the job's own result file, the
//! suite's [`RegressionSink`] and the run log. [`compare`] later lines two
//! result sets up by label and flags values that moved more than a tolerance.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;
use thiserror::Error;

use crate::context::RunContext;
use crate::error::{FailureKind, SpawnError};
use crate::macros::MacroTable;
use crate::state_machine::Job;

/// Prefix of every line that records a failed extraction.
pub const ERROR_MARKER: &str = "REGRESSION ERROR";

/// Smallest magnitude used as a divisor when computing relative differences.
const EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("pattern not found: <<{0}>>")]
    PatternNotFound(String),

    #[error("can not extract field {field} from <<{line}>>")]
    FieldMissing { field: usize, line: String },

    #[error("output is empty")]
    EmptyOutput,

    #[error("could not read {}: {source}", path.display())]
    OutputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which line of the output carries the value.
#[derive(Debug, Clone)]
pub enum Extraction {
    FirstLine,
    LastLine,
    /// First line matching the pattern.
    Grep(Regex),
}

/// Extraction rule such as `grep:Time:_ field:2 label:nodes margin:10p`.
#[derive(Debug, Clone)]
pub struct RegressionDirective {
    pub source: String,
    pub extraction: Extraction,
    /// 1-based whitespace-separated field of the chosen line.
    pub field: Option<usize>,
    /// Macro names whose values are prepended to the extracted value.
    pub labels: Vec<String>,
    /// Allowed relative difference when comparing against a baseline.
    pub margin: Option<f64>,
}

impl RegressionDirective {
    /// Parses a directive. `none` (or an empty string) means no regression.
    ///
    /// Clauses without a colon are skipped with a warning. In a `grep:`
    /// pattern, underscores stand for spaces.
    pub fn parse(text: &str) -> Result<Option<Self>, SpawnError> {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("none") {
            return Ok(None);
        }

        let mut extraction = None;
        let mut field = None;
        let mut labels = Vec::new();
        let mut margin = None;

        for clause in text.split_whitespace() {
            let Some((key, value)) = clause.split_once(':') else {
                tracing::warn!(clause, "ill-formed regression clause");
                continue;
            };
            match key {
                "line" => {
                    extraction = Some(match value {
                        "first" => Extraction::FirstLine,
                        "last" => Extraction::LastLine,
                        other => {
                            return Err(SpawnError::Config(format!(
                                "unsupported regression line selector <<{other}>>"
                            )));
                        }
                    });
                }
                "grep" => {
                    let pattern = value.replace('_', " ");
                    let re = Regex::new(&pattern).map_err(|e| {
                        SpawnError::Config(format!("invalid regression pattern <<{pattern}>>: {e}"))
                    })?;
                    extraction = Some(Extraction::Grep(re));
                }
                "field" => {
                    let n = value.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        SpawnError::Config(format!("regression field must be >= 1, got <<{value}>>"))
                    })?;
                    field = Some(n);
                }
                "label" => labels.push(value.to_string()),
                "margin" => margin = Some(parse_margin(value)?),
                other => tracing::warn!(key = other, "ignoring unknown regression clause"),
            }
        }

        let extraction = extraction.ok_or_else(|| {
            SpawnError::Config(format!(
                "regression <<{text}>> needs a line: or grep: clause"
            ))
        })?;

        Ok(Some(Self {
            source: text.to_string(),
            extraction,
            field,
            labels,
            margin,
        }))
    }

    /// Extracts the value from `output`, prefixed with any label values.
    pub fn extract(&self, output: &str, macros: &MacroTable) -> Result<String, RegressionError> {
        let line = match &self.extraction {
            Extraction::FirstLine => output.lines().next().ok_or(RegressionError::EmptyOutput)?,
            Extraction::LastLine => output.lines().last().ok_or(RegressionError::EmptyOutput)?,
            Extraction::Grep(re) => output
                .lines()
                .find(|line| re.is_match(line))
                .ok_or_else(|| RegressionError::PatternNotFound(re.as_str().to_string()))?,
        };
        let line = line.trim();

        let value = match self.field {
            Some(n) => line
                .split_whitespace()
                .nth(n - 1)
                .ok_or_else(|| RegressionError::FieldMissing {
                    field: n,
                    line: line.to_string(),
                })?
                .to_string(),
            None => line.to_string(),
        };

        if self.labels.is_empty() {
            return Ok(value);
        }
        let labels = self
            .labels
            .iter()
            .map(|l| macros.value_of(l))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("{labels} {value}"))
    }
}

/// `10p` and `10%` mean ten percent; a bare number is a fraction.
fn parse_margin(value: &str) -> Result<f64, SpawnError> {
    let invalid = || SpawnError::Config(format!("invalid regression margin <<{value}>>"));
    let margin = match value.strip_suffix('p').or_else(|| value.strip_suffix('%')) {
        Some(percent) => percent.parse::<f64>().map_err(|_| invalid())? / 100.0,
        None => value.parse::<f64>().map_err(|_| invalid())?,
    };
    if margin.is_finite() && margin >= 0.0 {
        Ok(margin)
    } else {
        Err(invalid())
    }
}

/// Append-only per-suite result file: one `<label> <value>` line per job.
#[derive(Debug)]
pub struct RegressionSink {
    path: PathBuf,
    file: File,
}

pub type SharedSink = Arc<Mutex<RegressionSink>>;

impl RegressionSink {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    pub fn shared(path: impl Into<PathBuf>) -> std::io::Result<SharedSink> {
        Ok(Arc::new(Mutex::new(Self::create(path)?)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, label: &str, value: &str) -> std::io::Result<()> {
        writeln!(self.file, "{label} {value}")?;
        self.file.flush()
    }
}

/// Runs a finished job's regression directive and records the result.
#[derive(Debug, Default)]
pub struct RegressionVerifier {
    /// Output lines matching this are removed before extraction.
    output_filter: Option<Regex>,
}

impl RegressionVerifier {
    pub fn new(output_filter: Option<Regex>) -> Self {
        Self { output_filter }
    }

    /// Strips filtered lines from the job's output, then extracts and records
    /// its value. Failures never propagate: they become an [`ERROR_MARKER`]
    /// line in every result stream.
    ///
    /// Returns the recorded line, or `None` when the job has no directive.
    pub fn verify(&self, job: &mut Job, ctx: &RunContext) -> Option<String> {
        let Some(directive) = job.regression.clone() else {
            if self.output_filter.is_some()
                && let Err(err) = self.read_output(&job.output_path)
            {
                tracing::debug!(job = %job.unique_name, error = %err, "output left unfiltered");
            }
            return None;
        };
        ctx.log(&format!(
            "Doing regression <<{}>> on job {} from <<{}>>",
            directive.source,
            job.unique_name,
            job.output_path.display()
        ));

        let recorded = match self
            .read_output(&job.output_path)
            .and_then(|output| directive.extract(&output, &job.macros))
        {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    kind = %FailureKind::Regression,
                    job = %job.unique_name,
                    error = %err,
                    "regression failed"
                );
                format!("{ERROR_MARKER}: {err}")
            }
        };

        let result_file = ctx.regression_dir().join(format!("{}.txt", job.unique_name));
        if let Err(err) = std::fs::write(&result_file, format!("{recorded}\n")) {
            tracing::warn!(file = %result_file.display(), error = %err, "could not write result file");
        }

        if let Some(sink) = &job.sink {
            match sink.lock() {
                Ok(mut sink) => {
                    if let Err(err) = sink.append(&job.result_label(), &recorded) {
                        tracing::warn!(file = %sink.path().display(), error = %err, "could not append to suite results");
                    }
                }
                Err(_) => tracing::warn!("suite result sink lock poisoned"),
            }
        }

        ctx.log(&format!(
            ".. done regression on {}, giving: {recorded}",
            job.unique_name
        ));
        tracing::info!(job = %job.unique_name, result = %recorded, "regression recorded");
        job.regression_result = Some(recorded.clone());
        Some(recorded)
    }

    fn read_output(&self, path: &Path) -> Result<String, RegressionError> {
        let unreadable = |source| RegressionError::OutputUnreadable {
            path: path.to_path_buf(),
            source,
        };
        let output = std::fs::read_to_string(path).map_err(unreadable)?;
        let Some(filter) = &self.output_filter else {
            return Ok(output);
        };
        let kept = output
            .lines()
            .filter(|line| !filter.is_match(line))
            .fold(String::new(), |mut acc, line| {
                acc.push_str(line);
                acc.push('\n');
                acc
            });
        std::fs::write(path, &kept).map_err(unreadable)?;
        Ok(kept)
    }
}

/// Label → recorded value.
pub type ResultSet = BTreeMap<String, String>;

/// Reads every regular file in `dir`; the label is the file name and the
/// value its first line.
pub fn load_result_set(dir: &Path) -> std::io::Result<ResultSet> {
    let mut set = ResultSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())?;
        let value = text.lines().next().unwrap_or_default().trim().to_string();
        set.insert(entry.file_name().to_string_lossy().into_owned(), value);
    }
    Ok(set)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Within(f64),
    /// Relative difference above the tolerance.
    Violation(f64),
    /// One side is not a number (or is an error marker).
    Unparsable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonEntry {
    pub label: String,
    pub baseline: String,
    pub current: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub tolerance: f64,
    pub entries: Vec<ComparisonEntry>,
    /// Labels in the current set with no baseline counterpart.
    pub unmatched: Vec<String>,
}

impl ComparisonReport {
    pub fn major_violations(&self) -> impl Iterator<Item = &ComparisonEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.verdict, Verdict::Violation(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ComparisonEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.verdict, Verdict::Unparsable))
    }

    /// Writes the rendered report to `path`.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_string())
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "Comparing: {}", e.label)?;
            writeln!(f, "{}", describe(e, self.tolerance))?;
        }
        for label in &self.unmatched {
            writeln!(f, "No baseline for: {label}")?;
        }
        let mut violations = self.major_violations().peekable();
        if violations.peek().is_some() {
            writeln!(f, "================ Major violations ================")?;
            for e in violations {
                writeln!(f, "{} {}", e.label, describe(e, self.tolerance))?;
            }
        }
        Ok(())
    }
}

fn describe(e: &ComparisonEntry, tolerance: f64) -> String {
    let verdict = match e.verdict {
        Verdict::Within(rel) => format!("inside {tolerance} margin ({rel:.4})"),
        Verdict::Violation(rel) => format!("outside {tolerance} margin ({rel:.4})"),
        Verdict::Unparsable => "margin comparison failed".to_string(),
    };
    format!("Output: {}, compare: {}, {verdict}", e.current, e.baseline)
}

/// Numeric part of a recorded value: its last whitespace-separated token.
fn numeric_value(recorded: &str) -> Option<f64> {
    if recorded.starts_with(ERROR_MARKER) {
        return None;
    }
    recorded
        .split_whitespace()
        .last()?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// `|a - b|` relative to the smaller magnitude, so the result does not depend
/// on which side is the baseline.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().min(b.abs()).max(EPSILON)
}

/// Compares `current` against `baseline` label by label.
pub fn compare(baseline: &ResultSet, current: &ResultSet, tolerance: f64) -> ComparisonReport {
    let mut entries = Vec::new();
    let mut unmatched = Vec::new();

    for (label, cur) in current {
        let Some(base) = baseline.get(label) else {
            unmatched.push(label.clone());
            continue;
        };
        let verdict = match (numeric_value(base), numeric_value(cur)) {
            (Some(b), Some(c)) => {
                let rel = relative_difference(b, c);
                if rel > tolerance {
                    Verdict::Violation(rel)
                } else {
                    Verdict::Within(rel)
                }
            }
            _ => Verdict::Unparsable,
        };
        entries.push(ComparisonEntry {
            label: label.clone(),
            baseline: base.clone(),
            current: cur.clone(),
            verdict,
        });
    }

    ComparisonReport {
        tolerance,
        entries,
        unmatched,
    }
}
