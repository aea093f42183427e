use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use super::parse::{parse_status_output, parse_submit_output};
use super::{JobId, SchedulerClient, SchedulerError, StatusCode};
use crate::config::AppConfig;

/// What a scheduler command printed, kept per stream.
struct CommandOutput {
    stdout: String,
    stderr: String,
}

/// Scheduler client that runs `sbatch` and `squeue` (or configured stand-ins).
pub struct SlurmClient {
    submit_command: Vec<String>,
    status_command: Vec<String>,
    status_format: String,
    command_timeout: Duration,
}

impl SlurmClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            submit_command: config.submit_command.clone(),
            status_command: config.status_command.clone(),
            status_format: config.status_format.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    /// Runs `argv`, waiting at most the configured timeout.
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SchedulerError::Spawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SchedulerError::Spawn {
                command: program.clone(),
                source,
            })?;

        let output = match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| SchedulerError::Spawn {
                command: program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(SchedulerError::Timeout {
                    command: program.clone(),
                    secs: self.command_timeout.as_secs(),
                });
            }
        };

        if !output.stderr.is_empty() {
            tracing::debug!(
                command = %program,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "scheduler command wrote to stderr"
            );
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| {
            SchedulerError::NonUtf8Output {
                command: program.clone(),
            }
        })?;
        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl SchedulerClient for SlurmClient {
    async fn submit(&self, script: &Path) -> Result<JobId, SchedulerError> {
        let mut argv = self.submit_command.clone();
        argv.push(script.display().to_string());
        let output = self.run(&argv).await?;
        for line in output.stdout.lines() {
            tracing::trace!(line = line.trim(), "submit output");
        }
        // Only stdout carries the id; sbatch explains rejections on stderr.
        parse_submit_output(&output.stdout).ok_or_else(|| SchedulerError::SubmitRejected {
            script: script.to_path_buf(),
            output: [output.stdout.trim(), output.stderr.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        })
    }

    async fn query_statuses(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusCode>, SchedulerError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let id_list = ids
            .iter()
            .map(JobId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut argv = self.status_command.clone();
        argv.extend([
            "-j".to_string(),
            id_list,
            "-h".to_string(),
            "-o".to_string(),
            self.status_format.clone(),
        ]);
        let output = self.run(&argv).await?;
        Ok(parse_status_output(&output.stdout))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn client(submit: &[&str], status: &[&str], secs: u64) -> SlurmClient {
        SlurmClient {
            submit_command: submit.iter().map(|s| s.to_string()).collect(),
            status_command: status.iter().map(|s| s.to_string()).collect(),
            status_format: "%A %t".into(),
            command_timeout: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn submit_parses_identifier_from_stdout() {
        let c = client(&["echo", "Submitted batch job 4242"], &["true"], 5);
        let id = c.submit(Path::new("job.script")).await.unwrap();
        assert_eq!(id, JobId(4242));
    }

    #[tokio::test]
    async fn submit_without_marker_is_rejected() {
        let c = client(&["echo", "sbatch: error: QOSMaxSubmitJobPerUserLimit"], &["true"], 5);
        let err = c.submit(Path::new("job.script")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::SubmitRejected { .. }));
    }

    #[tokio::test]
    async fn stderr_never_joins_the_identifier() {
        let c = client(
            &["sh", "-c", "printf 'Submitted batch job 12'; printf '3 warnings' >&2"],
            &["true"],
            5,
        );
        let id = c.submit(Path::new("job.script")).await.unwrap();
        assert_eq!(id, JobId(12));
    }

    #[tokio::test]
    async fn rejection_keeps_stderr_in_the_message() {
        let c = client(
            &["sh", "-c", "echo 'sbatch: error: Batch job submission failed' >&2"],
            &["true"],
            5,
        );
        let err = c.submit(Path::new("job.script")).await.unwrap_err();
        let SchedulerError::SubmitRejected { output, .. } = err else {
            panic!("expected a rejection");
        };
        assert_eq!(output, "sbatch: error: Batch job submission failed");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let c = client(&["/definitely/not/sbatch"], &["true"], 5);
        let err = c.submit(Path::new("job.script")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let c = client(&["sleep", "5"], &["true"], 0);
        let err = c.submit(Path::new("1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_id_set_skips_the_command() {
        let c = client(&["true"], &["/definitely/not/squeue"], 5);
        let statuses = c.query_statuses(&[]).await.unwrap();
        assert!(statuses.is_empty());
    }
}
