use std::path::PathBuf;

use thiserror::Error;

/// Structural errors raised while parsing a configuration or building jobs.
///
/// Anything in here is fatal for the run and is reported before a single
/// job reaches the scheduler.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("missing unique name")]
    MissingUniqueName,

    #[error("No output directory supplied")]
    MissingOutputDir,

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Job name conflict: {0}")]
    DuplicateJobName(String),

    #[error("unresolved macro: {0}")]
    MacroCycle(String),

    #[error("script write error: {path}: {source}")]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification of a failure, used when reporting per-job problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The scheduler refused or never acknowledged a submission.
    Submission,
    /// The status query failed or timed out.
    Query,
    /// Regression extraction or comparison failed.
    Regression,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Submission => write!(f, "Submission"),
            FailureKind::Query => write!(f, "Query"),
            FailureKind::Regression => write!(f, "Regression"),
        }
    }
}
