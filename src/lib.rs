//! dataplanerunner -- functional dataplane tests between a system under
//! test (SUT) and a traffic generator (TG).
//!
//! This crate provides the suite execution engine with per-phase failure
//! isolation and retries, the packet verifier that checks forwarded traffic,
//! the result tree with its report, and the Linux testbed nodes the
//! built-in suites run against.

pub mod config;
pub mod interrupt;
pub mod packet;
pub mod result;
pub mod suite;
pub mod suites;
pub mod testbed;

pub use interrupt::Interrupt;

use tracing::{error, info, warn};

use config::TestbedConfig;
use result::{ErrorSeverity, Fault, RunResult};
use suite::engine::Engine;
use suite::runner::Runner;
use suite::scheduler::CaseSelection;
use suite::SuiteEntry;
use testbed::linux::LinuxNode;
use testbed::session::{ShellSession, Transport};
use testbed::tg::PnetTrafficGenerator;
use testbed::Testbed;

/// Build the SUT and TG nodes described by `config`.
pub fn build_testbed(config: &TestbedConfig, interrupt: &Interrupt) -> Testbed {
    let timeout = config.run.command_timeout();
    let history_size = config.run.history_size;
    let node = |cfg: &config::NodeConfig| {
        let session = ShellSession::new(
            cfg.name.clone(),
            cfg.transport(),
            timeout,
            history_size,
            interrupt.clone(),
        );
        LinuxNode::new(cfg.name.clone(), cfg.ports.clone(), session)
            .with_sudo(cfg.sudo)
            .with_managed_processes(cfg.managed_processes.clone())
    };

    if config.tg.transport() != Transport::Local {
        warn!(
            tg = %config.tg.name,
            "Traffic is captured on this host's interfaces; the TG host setting only applies to configuration commands"
        );
    }

    Testbed {
        sut: Box::new(node(&config.sut)),
        tg: Box::new(PnetTrafficGenerator::new(node(&config.tg), interrupt.clone())),
    }
}

/// Look up the suites named in `names`, or every built-in suite when empty.
pub fn select_suites(names: &[String]) -> Result<Vec<SuiteEntry>, Fault> {
    if names.is_empty() {
        return Ok(suites::registry());
    }
    names
        .iter()
        .map(|name| {
            suites::find(name).ok_or_else(|| {
                Fault::new(format!("Test suite '{}' not found.", name), ErrorSeverity::Config)
            })
        })
        .collect()
}

/// Run the configured suites against `testbed`.
pub fn run_suites(config: &TestbedConfig, testbed: &mut Testbed, interrupt: Interrupt) -> RunResult {
    let mut run = RunResult::new();
    info!(run_id = %run.id, "Starting run");

    match select_suites(&config.run.suites) {
        Ok(suites) => {
            let selection = CaseSelection {
                functional_only: config.run.func,
                include: config.run.test_cases.iter().cloned().collect(),
            };
            let engine = Engine::new(selection, config.run.re_run, interrupt);
            Runner::new(engine, suites).run(testbed, &mut run);
        }
        Err(fault) => {
            error!(error = %fault, "Invalid suite selection");
            run.add_error(fault);
        }
    }

    run.finish();
    info!(
        run_id = %run.id,
        return_code = run.return_code().code(),
        "Run finished"
    );
    run
}

/// Build the testbed from `config` and run the configured suites on it.
pub fn run(config: &TestbedConfig, interrupt: Interrupt) -> RunResult {
    let mut testbed = build_testbed(config, &interrupt);
    run_suites(config, &mut testbed, interrupt)
}
