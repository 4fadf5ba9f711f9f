//! Selection of the test cases a suite runs in this invocation.

use std::collections::HashSet;

use tracing::debug;

use super::TestCase;

const TEST_CASE_PREFIX: &str = "test_";
const PERF_TEST_CASE_PREFIX: &str = "test_perf_";

/// Which cases of a suite to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseSelection {
    /// Run only functional cases. When false every test case runs,
    /// functional and performance alike.
    pub functional_only: bool,
    /// Case names to run; empty means all.
    pub include: HashSet<String>,
}

impl CaseSelection {
    pub fn functional() -> Self {
        Self {
            functional_only: true,
            include: HashSet::new(),
        }
    }

    pub fn with_cases<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.include.extend(names.into_iter().map(Into::into));
        self
    }

    /// Whether `name` is a test case at all and matches the selection.
    pub fn should_be_executed(&self, name: &str) -> bool {
        let matched = if self.functional_only {
            is_functional(name)
        } else {
            is_candidate(name)
        };
        matched && (self.include.is_empty() || self.include.contains(name))
    }
}

/// Whether `name` follows the test case naming convention.
pub fn is_candidate(name: &str) -> bool {
    name.starts_with(TEST_CASE_PREFIX)
}

/// Whether `name` is a test case that is not a performance case.
pub fn is_functional(name: &str) -> bool {
    is_candidate(name) && !name.starts_with(PERF_TEST_CASE_PREFIX)
}

/// Keep the cases `selection` asks for, in declaration order. Requested
/// names the suite does not declare are ignored.
pub fn schedule<S>(cases: Vec<TestCase<S>>, selection: &CaseSelection) -> Vec<TestCase<S>> {
    for name in &selection.include {
        if !cases.iter().any(|case| case.name == name.as_str()) {
            debug!(case = %name, "Requested test case not declared by this suite");
        }
    }
    let scheduled: Vec<_> = cases
        .into_iter()
        .filter(|case| selection.should_be_executed(case.name))
        .collect();
    debug!(
        cases = %scheduled.iter().map(|c| c.name).collect::<Vec<_>>().join(", "),
        "Scheduled test cases"
    );
    scheduled
}
