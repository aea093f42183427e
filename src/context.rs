//! Per-run state shared by every component: directories and the run log.
//!
//! Built once at program start and passed by reference; nothing here is a
//! global.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use uuid::Uuid;

use crate::error::SpawnError;

pub const LOG_FILE_NAME: &str = "jobspawn.log";

#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    root: PathBuf,
    script_dir: PathBuf,
    output_dir: PathBuf,
    regression_dir: PathBuf,
    log: Mutex<File>,
}

impl RunContext {
    /// Creates (or reuses) `root` and its `scripts/`, `output/` and
    /// `regression/` subdirectories and opens the run log for appending.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, SpawnError> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(SpawnError::MissingOutputDir);
        }
        let reused = root.is_dir();
        std::fs::create_dir_all(&root)?;

        let script_dir = ensure_subdir(&root, "scripts")?;
        let output_dir = ensure_subdir(&root, "output")?;
        let regression_dir = ensure_subdir(&root, "regression")?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(LOG_FILE_NAME))?;

        let ctx = Self {
            run_id: Uuid::new_v4(),
            root,
            script_dir,
            output_dir,
            regression_dir,
            log: Mutex::new(log),
        };
        if reused {
            tracing::info!(dir = %ctx.root.display(), "re-using output directory");
        } else {
            tracing::info!(dir = %ctx.root.display(), "created output directory");
        }
        ctx.log(&format!("==== run {} ====", ctx.run_id));
        Ok(ctx)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn regression_dir(&self) -> &Path {
        &self.regression_dir
    }

    /// Appends a timestamped line to the run log.
    ///
    /// A failing log write is reported through tracing and otherwise ignored.
    pub fn log(&self, msg: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let Ok(mut file) = self.log.lock() else {
            tracing::warn!("run log lock poisoned");
            return;
        };
        if let Err(err) = writeln!(file, "[{stamp}] {msg}") {
            tracing::warn!(error = %err, "could not write run log");
        }
    }
}

fn ensure_subdir(root: &Path, name: &str) -> Result<PathBuf, SpawnError> {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
