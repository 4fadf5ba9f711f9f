//! Runs a list of suites one after another against a single testbed.

use tracing::{error, info, warn};

use super::engine::{Engine, RunAbort};
use super::{SuiteContext, SuiteEntry};
use crate::result::{ErrorSeverity, Fault, RunResult};
use crate::testbed::{Node, Testbed, Topology};

pub struct Runner {
    engine: Engine,
    suites: Vec<SuiteEntry>,
}

impl Runner {
    pub fn new(engine: Engine, suites: Vec<SuiteEntry>) -> Self {
        Self { engine, suites }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run every suite in order, recording into `run`.
    ///
    /// A malformed port topology stops the run before any suite starts. A
    /// blocking suite failure or an operator interrupt skips the suites not
    /// yet run.
    pub fn run(&self, testbed: &mut Testbed, run: &mut RunResult) {
        let interrupt = self.engine.interrupt();
        let topology = match Topology::discover(testbed.sut.ports(), testbed.tg.ports()) {
            Ok(topology) => topology,
            Err(e) => {
                error!(error = %e, "Invalid testbed topology");
                run.add_error(Fault::new(e.to_string(), ErrorSeverity::Config));
                return;
            }
        };
        info!(
            sut_ingress = %topology.sut_ingress.os_name,
            sut_egress = %topology.sut_egress.os_name,
            tg_ingress = %topology.tg_ingress.os_name,
            tg_egress = %topology.tg_egress.os_name,
            "Testbed topology"
        );

        for (idx, entry) in self.suites.iter().enumerate() {
            if interrupt.is_raised() {
                let abort = RunAbort::Interrupted;
                run.add_error(Fault::new(abort.to_string(), abort.severity()));
                break;
            }

            let mut ctx = SuiteContext::new(testbed, topology.clone(), interrupt.clone());
            let result = run.add_test_suite(entry.name);
            if let Err(abort) = entry.run(&self.engine, &mut ctx, result) {
                let skipped: Vec<_> = self.suites[idx + 1..].iter().map(|s| s.name).collect();
                if !skipped.is_empty() {
                    warn!(skipped = %skipped.join(", "), "Skipping remaining test suites");
                }
                error!(error = %abort, "Aborting run");
                run.add_error(Fault::new(abort.to_string(), abort.severity()));
                break;
            }
        }
    }
}
