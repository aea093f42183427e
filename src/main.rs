mod cli;
mod config;
mod context;
mod error;
mod logging;
mod macros;
mod queue;
mod registry;
mod regression;
mod scheduler;
mod script;
mod state_machine;
mod suite;
mod ui;

use std::path::Path;

use anyhow::Context;
use clap::Parser;

use cli::{Cli, Command};
use config::AppConfig;
use registry::{QueueRegistry, WaitOutcome};
use regression::RegressionVerifier;
use scheduler::SlurmClient;
use suite::Mode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    match cli.command {
        Command::Run {
            config,
            test,
            regress_only,
            poll_secs,
            limits,
        } => {
            let mode = if test {
                Mode::DryRun
            } else if regress_only {
                Mode::RegressOnly
            } else {
                Mode::Submit
            };
            run(&config, mode, poll_secs, &limits).await
        }
        Command::Show { config } => show(&config),
        Command::Compare {
            baseline,
            current,
            tolerance,
        } => {
            let report = suite::compare_with_baseline(&baseline, &current, tolerance)?;
            ui::print_comparison(&report);
            Ok(())
        }
    }
}

async fn run(
    path: &Path,
    mode: Mode,
    poll_secs: Option<u64>,
    limits: &[(String, usize)],
) -> anyhow::Result<()> {
    let mut app = AppConfig::load().context("loading jobspawn.toml")?;
    if let Some(secs) = poll_secs {
        app.poll_interval_secs = secs;
    }
    let configuration =
        suite::parse_file(path).with_context(|| format!("parsing {}", path.display()))?;

    let client = SlurmClient::new(&app);
    let verifier = RegressionVerifier::new(app.output_filter()?);
    let mut registry = QueueRegistry::new(app.poll_interval(), verifier);
    for queue in &configuration.queues {
        registry.add_queue(&queue.name, queue.limit);
    }
    for (name, limit) in limits {
        registry
            .set_limit(name, *limit)
            .with_context(|| format!("applying --limit {name}={limit}"))?;
    }
    for queue in registry.queues() {
        tracing::info!(queue = queue.name(), limit = queue.limit(), "queue ready");
    }

    for spec in &configuration.suites {
        let progress = (mode == Mode::Submit).then(|| ui::PollProgress::start(&spec.name));
        let report = suite::run_suite(
            spec,
            &mut registry,
            &client,
            app.lifecycle_policy(),
            mode,
            |tick| {
                if let Some(progress) = &progress {
                    progress.update(tick);
                }
            },
            ctrl_c(),
        )
        .await
        .with_context(|| format!("running suite {}", spec.name));
        if let Some(progress) = &progress {
            progress.finish();
        }

        let report = report?;
        ui::print_suite_report(&report);
        if let Some(WaitOutcome::Interrupted { unfinished }) = report.outcome {
            anyhow::bail!("interrupted with {unfinished} unfinished jobs");
        }
    }
    Ok(())
}

fn show(path: &Path) -> anyhow::Result<()> {
    let configuration =
        suite::parse_file(path).with_context(|| format!("parsing {}", path.display()))?;
    for queue in &configuration.queues {
        println!("queue {} limit:{}", queue.name, queue.limit);
    }
    for spec in &configuration.suites {
        let points = suite::matrix(spec)?;
        ui::print_suite_plan(spec, &points);
    }
    Ok(())
}

/// Resolves on Ctrl-C; never resolves if the signal cannot be watched.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
