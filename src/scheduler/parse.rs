//! Parsers for scheduler command output.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{JobId, StatusCode};

static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted.* ([0-9]+)").expect("submit pattern is valid"));

/// Scans submit output for `Submitted ... <integer>` and returns the integer.
pub fn parse_submit_output(output: &str) -> Option<JobId> {
    output.lines().map(str::trim).find_map(|line| {
        SUBMITTED
            .captures(line)
            .and_then(|caps| caps[1].parse::<u64>().ok())
            .map(JobId)
    })
}

/// Parses `<id> <code>` lines from a batched status query.
///
/// Malformed lines are skipped; the ids they would have named simply come out
/// as absent for this tick.
pub fn parse_status_output(output: &str) -> HashMap<JobId, StatusCode> {
    let mut statuses = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(id), Some(code), None) = (fields.next(), fields.next(), fields.next()) else {
            tracing::warn!(line, "skipping malformed status line");
            continue;
        };
        let Ok(id) = id.parse::<u64>() else {
            tracing::warn!(line, "skipping status line with non-numeric id");
            continue;
        };
        if code.is_empty() || code.len() > 2 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            tracing::warn!(line, "skipping status line with unexpected code");
            continue;
        }
        statuses.insert(JobId(id), StatusCode::from_code(code));
    }
    statuses
}
