//! Run statistics and the on-disk report.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use super::{ErrorSeverity, Fault, RunResult, Verdict};

pub const STATISTICS_FILE: &str = "statistics.txt";
pub const RESULTS_FILE: &str = "results.json";

/// Per-verdict counts over the overall results of every executed case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub skip: usize,
}

impl Statistics {
    pub fn from_run(run: &RunResult) -> Self {
        let mut stats = Self::default();
        for case in run.suites.iter().flat_map(|s| &s.cases) {
            stats.add(case.overall());
        }
        stats
    }

    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Error => self.error += 1,
            Verdict::Skip => self.skip += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.error + self.skip
    }

    /// Percentage of cases that passed.
    pub fn pass_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.pass as f64 * 100.0 / total as f64,
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12} = {}", "PASS", self.pass)?;
        writeln!(f, "{:<12} = {}", "FAIL", self.fail)?;
        writeln!(f, "{:<12} = {}", "ERROR", self.error)?;
        writeln!(f, "{:<12} = {}", "SKIP", self.skip)?;
        writeln!(f, "{:<12} = {}", "PASS RATE", self.pass_rate())
    }
}

/// Flattened view of a case for `results.json`.
#[derive(Debug, Serialize)]
struct CaseReport<'a> {
    suite: &'a str,
    case: &'a str,
    result: Verdict,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<&'a Fault>,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    run: &'a RunResult,
    statistics: Statistics,
    cases: Vec<CaseReport<'a>>,
    return_code: ErrorSeverity,
}

/// Format a run as a short human-readable summary.
pub fn format_summary(run: &RunResult) -> String {
    let stats = run.statistics();
    let mut summary = format!(
        "{} test case{}: {} passed, {} failed, {} errored, {} skipped ({:.1}% pass rate)",
        stats.total(),
        if stats.total() == 1 { "" } else { "s" },
        stats.pass,
        stats.fail,
        stats.error,
        stats.skip,
        stats.pass_rate(),
    );

    for suite in &run.suites {
        for case in &suite.cases {
            let verdict = case.overall();
            if verdict.is_pass() {
                continue;
            }
            summary.push_str(&format!("\n  {}.{}: {}", suite.name, case.name, verdict));
            if let Some(fault) = case.fault() {
                summary.push_str(&format!(" ({})", fault));
            }
        }
    }
    for error in &run.errors {
        summary.push_str(&format!("\n  run error: {}", error));
    }
    summary
}

/// Write `statistics.txt` and `results.json` into `dir`, creating it if
/// needed. Returns the path of the statistics file.
pub fn write_report(run: &RunResult, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let statistics = run.statistics();
    let stats_path = dir.join(STATISTICS_FILE);
    fs::write(&stats_path, statistics.to_string())
        .with_context(|| format!("Failed to write {}", stats_path.display()))?;

    let cases = run
        .suites
        .iter()
        .flat_map(|suite| {
            suite.cases.iter().map(move |case| CaseReport {
                suite: &suite.name,
                case: &case.name,
                result: case.overall(),
                attempts: case.attempts,
                fault: case.fault(),
            })
        })
        .collect();
    let report = RunReport {
        run,
        statistics,
        cases,
        return_code: run.return_code(),
    };
    let json_path = dir.join(RESULTS_FILE);
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize run results")?;
    fs::write(&json_path, json)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    debug!(path = %json_path.display(), "Wrote results");
    info!(path = %stats_path.display(), "Wrote statistics");
    Ok(stats_path)
}
