//! Phased execution of one suite: suite setup, every scheduled case
//! (setup, execute, teardown, with retries), suite teardown.
//!
//! Each phase runs behind a boundary that turns both returned errors and
//! panics into a recorded verdict, so a broken case never takes the rest of
//! the suite down with it. Teardown phases always run, shielded from
//! operator interruption.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::{error, info, warn};

use super::retry::should_retry;
use super::scheduler::{schedule, CaseSelection};
use super::{SuiteContext, TestCase, TestError, TestSuite};
use crate::interrupt::Interrupt;
use crate::result::{ErrorSeverity, Fault, TestCaseResult, TestSuiteResult, Verdict};
use crate::testbed::SutNode;

/// Conditions that end the whole run, not just the current suite.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunAbort {
    #[error("blocking test suite {suite} failed, skipping the remaining test suites")]
    Blocking { suite: String },

    #[error("run interrupted by operator")]
    Interrupted,
}

impl RunAbort {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RunAbort::Blocking { .. } => ErrorSeverity::BlockingSuite,
            RunAbort::Interrupted => ErrorSeverity::Generic,
        }
    }
}

/// Result of one attempt of a case.
#[derive(Debug)]
pub struct CaseAttempt {
    pub result: TestCaseResult,
    /// The operator asked to stop during or before the end of this attempt.
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct Engine {
    selection: CaseSelection,
    re_run: u32,
    interrupt: Interrupt,
}

impl Engine {
    pub fn new(selection: CaseSelection, re_run: u32, interrupt: Interrupt) -> Self {
        Self {
            selection,
            re_run,
            interrupt,
        }
    }

    pub fn selection(&self) -> &CaseSelection {
        &self.selection
    }

    pub fn re_run(&self) -> u32 {
        self.re_run
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Run `suite` and record every phase into `result`.
    ///
    /// Returns an error only when the rest of the run must stop: the
    /// operator interrupted it, or `suite` is blocking and something in it
    /// failed.
    pub fn run_suite<S: TestSuite>(
        &self,
        suite: &mut S,
        ctx: &mut SuiteContext<'_>,
        result: &mut TestSuiteResult,
    ) -> Result<(), RunAbort> {
        let name = S::NAME;
        let mut interrupted = false;

        info!(suite = name, "Starting test suite setup");
        match invoke_phase(|| suite.set_up_suite(ctx)) {
            Ok(()) => {
                result.record_setup(Verdict::Pass, None);
                info!(suite = name, "Test suite setup successful");
                interrupted = self.execute_test_suite(suite, ctx, result);
            }
            Err(e) => {
                let verdict = match e {
                    TestError::Interrupted => {
                        interrupted = true;
                        Verdict::Skip
                    }
                    _ => Verdict::Error,
                };
                error!(suite = name, error = %ErrorLog(&e), "Test suite setup {}", verdict);
                result.record_setup(verdict, Some(Fault::from(&e)));
            }
        }

        let teardown = self.interrupt.shielded(|| {
            invoke_phase(|| -> Result<(), TestError> {
                suite.tear_down_suite(ctx)?;
                ctx.sut().terminate_managed_processes()?;
                Ok(())
            })
        });
        match teardown {
            Ok(()) => result.record_teardown(Verdict::Pass, None),
            Err(e) => {
                error!(suite = name, error = %ErrorLog(&e), "Test suite teardown ERROR");
                warn!(
                    suite = name,
                    "Test suite teardown failed, the next test suite may be affected"
                );
                result.record_teardown(Verdict::Error, Some(Fault::from(&e)));
            }
        }

        if interrupted || self.interrupt.is_raised() {
            return Err(RunAbort::Interrupted);
        }
        if S::BLOCKING && result.has_failures() {
            error!(suite = name, "Blocking test suite failed");
            return Err(RunAbort::Blocking {
                suite: name.to_string(),
            });
        }
        Ok(())
    }

    /// Run every scheduled case. Returns whether the run was interrupted.
    fn execute_test_suite<S: TestSuite>(
        &self,
        suite: &mut S,
        ctx: &mut SuiteContext<'_>,
        result: &mut TestSuiteResult,
    ) -> bool {
        for case in schedule(suite.test_cases(), &self.selection) {
            if self.interrupt.is_raised() {
                return true;
            }
            let attempt = self.run_test_case_with_retries(suite, ctx, case);
            result.add_test_case(attempt.result);
            if attempt.interrupted {
                return true;
            }
        }
        false
    }

    /// Run `case` until it passes or the retries run out. Only the last
    /// attempt is kept.
    pub fn run_test_case_with_retries<S: TestSuite>(
        &self,
        suite: &mut S,
        ctx: &mut SuiteContext<'_>,
        case: TestCase<S>,
    ) -> CaseAttempt {
        let all_attempts = self.re_run.saturating_add(1);
        let mut attempt_nr = 1;
        let mut attempt = self.run_test_case(suite, ctx, case);
        while !attempt.interrupted && should_retry(attempt_nr, self.re_run, &attempt.result) {
            attempt_nr += 1;
            info!(
                case = case.name,
                "Re-running FAILED test case, attempt {} out of {}", attempt_nr, all_attempts
            );
            attempt = self.run_test_case(suite, ctx, case);
        }
        attempt.result.attempts = attempt_nr;
        attempt
    }

    /// One setup, execute, teardown pass over `case`.
    pub fn run_test_case<S: TestSuite>(
        &self,
        suite: &mut S,
        ctx: &mut SuiteContext<'_>,
        case: TestCase<S>,
    ) -> CaseAttempt {
        let mut result = TestCaseResult::new(case.name);
        let mut interrupted = false;

        match invoke_phase(|| suite.set_up_test_case(ctx)) {
            Ok(()) => {
                result.record_setup(Verdict::Pass, None);
                interrupted = self.execute_test_case(suite, ctx, case, &mut result);
            }
            Err(e) => {
                // Remote command timeouts count as failed assertions.
                let verdict = match e {
                    TestError::CommandTimeout { .. } => Verdict::Fail,
                    TestError::Interrupted => {
                        interrupted = true;
                        Verdict::Skip
                    }
                    _ => Verdict::Error,
                };
                error!(case = case.name, error = %ErrorLog(&e), "Test case setup {}", verdict);
                result.record_setup(verdict, Some(Fault::from(&e)));
            }
        }

        let teardown = self
            .interrupt
            .shielded(|| invoke_phase(|| suite.tear_down_test_case(ctx)));
        match teardown {
            Ok(()) => result.record_teardown(Verdict::Pass, None),
            Err(e) => {
                error!(case = case.name, error = %ErrorLog(&e), "Test case teardown ERROR");
                warn!(
                    case = case.name,
                    "Test case teardown failed, the next test case may be affected"
                );
                result.record_teardown(Verdict::Error, Some(Fault::from(&e)));
            }
        }

        CaseAttempt {
            result,
            interrupted: interrupted || self.interrupt.is_raised(),
        }
    }

    /// Returns whether the case body was interrupted.
    fn execute_test_case<S: TestSuite>(
        &self,
        suite: &mut S,
        ctx: &mut SuiteContext<'_>,
        case: TestCase<S>,
        result: &mut TestCaseResult,
    ) -> bool {
        info!(case = case.name, "Starting test case execution");
        let func = case.func;
        match invoke_phase(|| func(suite, ctx)) {
            Ok(()) => {
                result.record_execute(Verdict::Pass, None);
                info!(case = case.name, "Test case execution PASSED");
                false
            }
            Err(TestError::Interrupted) => {
                error!(case = case.name, "Test case execution INTERRUPTED by user");
                result.record_execute(Verdict::Skip, None);
                true
            }
            Err(e) => {
                let verdict = match e {
                    TestError::Verify(_) => Verdict::Fail,
                    _ => Verdict::Error,
                };
                error!(case = case.name, error = %ErrorLog(&e), "Test case execution {}", verdict);
                result.record_execute(verdict, Some(Fault::from(&e)));
                false
            }
        }
    }
}

/// Call one phase, turning a panic into an ordinary fault.
fn invoke_phase<F>(phase: F) -> Result<(), TestError>
where
    F: FnOnce() -> Result<(), TestError>,
{
    match panic::catch_unwind(AssertUnwindSafe(phase)) {
        Ok(result) => result,
        Err(payload) => Err(TestError::Fault(anyhow::anyhow!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

// Full error chain for log fields.
struct ErrorLog<'a>(&'a TestError);

impl std::fmt::Display for ErrorLog<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Fault::from(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_becomes_fault() {
        let err = invoke_phase(|| panic!("index out of bounds")).unwrap_err();
        match err {
            TestError::Fault(e) => assert_eq!(e.to_string(), "panicked: index out of bounds"),
            other => panic!("unexpected error: {:?}", other),
        }

        let msg = String::from("formatted 42");
        let err = invoke_phase(move || panic!("{}", msg)).unwrap_err();
        assert!(err.to_string().contains("formatted 42"));
    }

    #[test]
    fn test_returned_error_passes_through() {
        let err = invoke_phase(|| Err(TestError::verify("nope"))).unwrap_err();
        assert!(matches!(err, TestError::Verify(ref m) if m == "nope"));
        assert!(invoke_phase(|| Ok(())).is_ok());
    }

    #[test]
    fn test_abort_severity() {
        let blocking = RunAbort::Blocking {
            suite: "smoke".into(),
        };
        assert_eq!(blocking.severity().code(), 25);
        assert_eq!(RunAbort::Interrupted.severity(), ErrorSeverity::Generic);
    }
}
