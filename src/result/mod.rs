//! Result tree for a run: run -> suites -> cases -> phases.
//!
//! Every phase records a [`Verdict`] and, when it did not pass, the
//! [`Fault`] that caused it. Case and suite outcomes are derived from the
//! recorded phases, never stored separately.

pub mod report;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Outcome of one phase, ordered by severity: `Pass < Skip < Fail < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Skip,
    Fail,
    Error,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "PASS",
            Verdict::Skip => "SKIP",
            Verdict::Fail => "FAIL",
            Verdict::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Severity of a fault, doubling as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    NoError = 0,
    Generic = 1,
    Config = 2,
    RemoteCommand = 3,
    Ssh = 4,
    TestCaseVerify = 20,
    BlockingSuite = 25,
}

impl ErrorSeverity {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Human-readable cause of a non-passing phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub message: String,
    pub severity: ErrorSeverity,
}

impl Fault {
    pub fn new(message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl PhaseOutcome {
    pub fn new(verdict: Verdict, fault: Option<Fault>) -> Self {
        Self { verdict, fault }
    }

    pub fn pass() -> Self {
        Self::new(Verdict::Pass, None)
    }
}

/// Phases of one case invocation. Only the final attempt of a retried case
/// is kept; `attempts` says how many were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCaseResult {
    pub name: String,
    pub setup: Option<PhaseOutcome>,
    pub execute: Option<PhaseOutcome>,
    pub teardown: Option<PhaseOutcome>,
    pub attempts: u32,
}

impl TestCaseResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            execute: None,
            teardown: None,
            attempts: 1,
        }
    }

    pub fn record_setup(&mut self, verdict: Verdict, fault: Option<Fault>) {
        self.setup = Some(PhaseOutcome::new(verdict, fault));
    }

    pub fn record_execute(&mut self, verdict: Verdict, fault: Option<Fault>) {
        self.execute = Some(PhaseOutcome::new(verdict, fault));
    }

    pub fn record_teardown(&mut self, verdict: Verdict, fault: Option<Fault>) {
        self.teardown = Some(PhaseOutcome::new(verdict, fault));
    }

    fn phases(&self) -> impl Iterator<Item = &PhaseOutcome> {
        [&self.setup, &self.execute, &self.teardown]
            .into_iter()
            .flatten()
    }

    /// PASS iff all three phases passed, else the most severe recorded
    /// verdict. A phase that never ran (execute after a failed setup) does
    /// not lower the result below that of the phases that did.
    pub fn overall(&self) -> Verdict {
        let recorded: Vec<_> = self.phases().collect();
        if recorded.len() == 3 && recorded.iter().all(|p| p.verdict.is_pass()) {
            return Verdict::Pass;
        }
        self.phases()
            .map(|p| p.verdict)
            .filter(|v| !v.is_pass())
            .max()
            .unwrap_or(Verdict::Fail)
    }

    pub fn passed(&self) -> bool {
        self.overall().is_pass()
    }

    /// Fault of the phase that decided the overall verdict.
    pub fn fault(&self) -> Option<&Fault> {
        let overall = self.overall();
        self.phases()
            .filter(|p| p.verdict == overall)
            .find_map(|p| p.fault.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSuiteResult {
    pub name: String,
    pub setup: Option<PhaseOutcome>,
    pub teardown: Option<PhaseOutcome>,
    /// In execution order.
    pub cases: Vec<TestCaseResult>,
}

impl TestSuiteResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            teardown: None,
            cases: Vec::new(),
        }
    }

    pub fn record_setup(&mut self, verdict: Verdict, fault: Option<Fault>) {
        self.setup = Some(PhaseOutcome::new(verdict, fault));
    }

    pub fn record_teardown(&mut self, verdict: Verdict, fault: Option<Fault>) {
        self.teardown = Some(PhaseOutcome::new(verdict, fault));
    }

    pub fn add_test_case(&mut self, result: TestCaseResult) {
        self.cases.push(result);
    }

    pub fn setup_passed(&self) -> bool {
        self.setup.as_ref().is_some_and(|o| o.verdict.is_pass())
    }

    /// Whether any suite phase or case ended in FAIL or ERROR.
    pub fn has_failures(&self) -> bool {
        let bad = |v: Verdict| v >= Verdict::Fail;
        [&self.setup, &self.teardown]
            .into_iter()
            .flatten()
            .any(|o| bad(o.verdict))
            || self.cases.iter().any(|c| bad(c.overall()))
    }

    fn faults(&self) -> impl Iterator<Item = &Fault> {
        [&self.setup, &self.teardown]
            .into_iter()
            .flatten()
            .chain(self.cases.iter().flat_map(|c| c.phases()))
            .filter_map(|o| o.fault.as_ref())
    }
}

/// Everything recorded during one invocation of the runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub suites: Vec<TestSuiteResult>,
    /// Faults raised outside any suite phase (configuration, aborts).
    pub errors: Vec<Fault>,
}

impl RunResult {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            suites: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_test_suite(&mut self, name: impl Into<String>) -> &mut TestSuiteResult {
        self.suites.push(TestSuiteResult::new(name));
        let last = self.suites.len() - 1;
        &mut self.suites[last]
    }

    pub fn add_error(&mut self, fault: Fault) {
        self.errors.push(fault);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn statistics(&self) -> report::Statistics {
        report::Statistics::from_run(self)
    }

    /// Highest severity of any recorded fault.
    pub fn return_code(&self) -> ErrorSeverity {
        self.errors
            .iter()
            .chain(self.suites.iter().flat_map(|s| s.faults()))
            .map(|f| f.severity)
            .max()
            .unwrap_or(ErrorSeverity::NoError)
    }
}

impl Default for RunResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(severity: ErrorSeverity) -> Option<Fault> {
        Some(Fault::new("boom", severity))
    }

    fn case(setup: Verdict, execute: Option<Verdict>, teardown: Verdict) -> TestCaseResult {
        let mut c = TestCaseResult::new("test_x");
        c.record_setup(setup, None);
        if let Some(v) = execute {
            c.record_execute(v, None);
        }
        c.record_teardown(teardown, None);
        c
    }

    #[test]
    fn test_verdict_severity_order() {
        assert!(Verdict::Error > Verdict::Fail);
        assert!(Verdict::Fail > Verdict::Skip);
        assert!(Verdict::Skip > Verdict::Pass);
    }

    #[test]
    fn test_all_phases_pass() {
        let c = case(Verdict::Pass, Some(Verdict::Pass), Verdict::Pass);
        assert_eq!(c.overall(), Verdict::Pass);
        assert!(c.passed());
    }

    #[test]
    fn test_teardown_error_overrides_execute() {
        for execute in [Verdict::Pass, Verdict::Fail, Verdict::Skip] {
            let c = case(Verdict::Pass, Some(execute), Verdict::Error);
            assert_eq!(c.overall(), Verdict::Error);
        }
    }

    #[test]
    fn test_most_severe_phase_wins() {
        let c = case(Verdict::Pass, Some(Verdict::Fail), Verdict::Pass);
        assert_eq!(c.overall(), Verdict::Fail);
        let c = case(Verdict::Fail, None, Verdict::Pass);
        assert_eq!(c.overall(), Verdict::Fail);
        let c = case(Verdict::Pass, Some(Verdict::Skip), Verdict::Pass);
        assert_eq!(c.overall(), Verdict::Skip);
    }

    #[test]
    fn test_unfinished_case_is_not_a_pass() {
        let mut c = TestCaseResult::new("test_x");
        c.record_setup(Verdict::Pass, None);
        assert_eq!(c.overall(), Verdict::Fail);
    }

    #[test]
    fn test_fault_comes_from_deciding_phase() {
        let mut c = TestCaseResult::new("test_x");
        c.record_setup(Verdict::Pass, None);
        c.record_execute(Verdict::Fail, Some(Fault::new("no packet", ErrorSeverity::TestCaseVerify)));
        c.record_teardown(Verdict::Error, Some(Fault::new("cleanup", ErrorSeverity::Generic)));
        assert_eq!(c.fault().map(|f| f.message.as_str()), Some("cleanup"));
    }

    #[test]
    fn test_suite_failures() {
        let mut suite = TestSuiteResult::new("s");
        suite.record_setup(Verdict::Pass, None);
        suite.add_test_case(case(Verdict::Pass, Some(Verdict::Skip), Verdict::Pass));
        suite.record_teardown(Verdict::Pass, None);
        assert!(!suite.has_failures());

        suite.add_test_case(case(Verdict::Pass, Some(Verdict::Fail), Verdict::Pass));
        assert!(suite.has_failures());
    }

    #[test]
    fn test_return_code_is_highest_severity() {
        let mut run = RunResult::new();
        assert_eq!(run.return_code(), ErrorSeverity::NoError);

        let suite = run.add_test_suite("s");
        suite.record_setup(Verdict::Error, fault(ErrorSeverity::Ssh));
        assert_eq!(run.return_code(), ErrorSeverity::Ssh);

        run.add_error(Fault::new("blocked", ErrorSeverity::BlockingSuite));
        assert_eq!(run.return_code().code(), 25);
    }
}
