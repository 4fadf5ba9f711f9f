//! Re-run decision for failed test cases.

use crate::result::TestCaseResult;

/// Whether a case should run again after `attempt` attempts (1-based).
///
/// `max_retries` counts the attempts allowed beyond the first. Only a case
/// whose overall result is not a pass is retried.
pub fn should_retry(attempt: u32, max_retries: u32, last: &TestCaseResult) -> bool {
    !last.passed() && attempt < max_retries.saturating_add(1)
}
