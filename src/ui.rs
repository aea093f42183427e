//! Interface de terminal do jobspawn: spinner de polling e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner do laço de reconciliação e
//! `console` para estilização com cores. O [`PollProgress`] mostra as
//! contagens de jobs a cada tick.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::registry::{Tick, WaitOutcome};
use crate::regression::{ComparisonReport, Verdict};
use crate::state_machine::State;
use crate::suite::{MatrixPoint, SuiteReport, SuiteSpec, DEFAULT_QUEUE};

/// Indicador visual do laço de polling de uma suíte.
pub struct PollProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
}

impl PollProgress {
    /// Inicia o spinner para a suíte indicada.
    pub fn start(suite: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed}] {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{suite}: submitting"));
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { pb }
    }

    /// Atualiza a mensagem com as contagens do último tick.
    pub fn update(&self, tick: &Tick) {
        self.pb.set_message(tick_message(tick));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

fn tick_message(tick: &Tick) -> String {
    format!(
        "unfinished: {}, running: {}, pending: {}",
        tick.unfinished, tick.running, tick.pending
    )
}

/// Imprime o resultado de uma suíte: um job por linha, colorido pelo estado.
pub fn print_suite_report(report: &SuiteReport) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    println!();
    println!("{}", Style::new().bold().apply_to(format!("─── Suite {} ───", report.suite)));
    for record in &report.records {
        let (mark, style) = match record.state {
            State::Done => ("✓", &green),
            State::SubmitFailed => ("✗", &red),
            _ => ("·", &yellow),
        };
        let result = record
            .regression_result
            .as_deref()
            .map(|r| format!("  {}", dim.apply_to(r)))
            .unwrap_or_default();
        println!(
            "  {} {} {}{result}",
            style.apply_to(mark),
            record.unique_name,
            dim.apply_to(record.state)
        );
    }
    match report.outcome {
        Some(WaitOutcome::Completed { ticks }) => {
            println!("  {} {} jobs finished after {ticks} polls", green.apply_to("✓"), report.jobs);
        }
        Some(WaitOutcome::Interrupted { unfinished }) => {
            println!("  {} interrupted with {unfinished} unfinished jobs", yellow.apply_to("!"));
        }
        None => println!("  {} {} jobs, nothing submitted", dim.apply_to("·"), report.jobs),
    }
    if let Some(comparison) = &report.comparison {
        print_comparison(comparison);
    }
}

/// Imprime a comparação; violações em vermelho, falhas em amarelo.
pub fn print_comparison(report: &ComparisonReport) {
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();
    let green = Style::new().green();

    println!();
    println!("Comparison with tolerance {}", report.tolerance);
    for entry in &report.entries {
        let verdict = match entry.verdict {
            Verdict::Within(rel) => green.apply_to(format!("ok ({rel:.4})")),
            Verdict::Violation(rel) => red.apply_to(format!("VIOLATION ({rel:.4})")),
            Verdict::Unparsable => yellow.apply_to("unparsable".to_string()),
        };
        println!(
            "  {}: {} vs {} {verdict}",
            entry.label, entry.current, entry.baseline
        );
    }
    for label in &report.unmatched {
        println!("  {}: {}", label, yellow.apply_to("no baseline"));
    }
    let failures = report.failures().count();
    if failures > 0 {
        println!("  {}", yellow.apply_to(format!("{failures} values could not be compared")));
    }
    let violations = report.major_violations().count();
    if violations > 0 {
        println!("  {}", red.apply_to(format!("{violations} major violations")));
    }
}

/// Imprime uma suíte e sua matriz de jobs sem criar nada em disco.
pub fn print_suite_plan(suite: &SuiteSpec, points: &[MatrixPoint]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!("{}", bold.apply_to(format!("Suite {}", suite.name)));
    println!("  dir: {}", suite.dir.display());
    if !suite.runner.is_empty() {
        println!("  runner: {}", suite.runner.trim_end());
    }
    println!("  queue: {}", suite.options.get("queue").unwrap_or(DEFAULT_QUEUE));
    println!(
        "  regression: {}",
        suite
            .regression
            .as_ref()
            .map(|r| r.source.as_str())
            .unwrap_or("none")
    );
    for (key, value) in suite.options.iter() {
        println!("  {} {}", dim.apply_to(key), value);
    }
    for point in points {
        println!(
            "    {} N={} ppn={} threads={}",
            point.unique_name(&suite.name),
            point.nodes,
            point.ppn,
            point.threads
        );
    }
}
