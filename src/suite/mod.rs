//! Test suites, test cases and the context they run in.
//!
//! A suite declares its cases explicitly as an ordered list of
//! `(name, fn)` pairs. Every hook and case body returns a
//! `Result<(), TestError>`; the engine turns the error variant into the
//! phase verdict.

pub mod engine;
pub mod retry;
pub mod runner;
pub mod scheduler;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::interrupt::Interrupt;
use crate::packet::verify::PacketVerifier;
use crate::packet::{Packet, PacketError};
use crate::result::{ErrorSeverity, Fault, TestSuiteResult};
use crate::testbed::session::SessionError;
use crate::testbed::{
    Node, SutNode, Testbed, TestbedError, TgNode, Topology, TrafficGenerator,
    SUT_EGRESS_ADDRESS, SUT_INGRESS_ADDRESS, TG_EGRESS_ADDRESS, TG_INGRESS_ADDRESS,
};
use engine::{Engine, RunAbort};

/// Default time to capture after sending a packet.
pub const DEFAULT_CAPTURE_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TestError {
    /// An explicit check on observed behavior did not hold.
    #[error("{0}")]
    Verify(String),

    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl TestError {
    pub fn verify(description: impl Into<String>) -> Self {
        TestError::Verify(description.into())
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TestError::Verify(_) => ErrorSeverity::TestCaseVerify,
            TestError::CommandTimeout { .. } => ErrorSeverity::Ssh,
            TestError::Interrupted => ErrorSeverity::Generic,
            TestError::Fault(e) => {
                let session = e.downcast_ref::<SessionError>().or_else(|| {
                    match e.downcast_ref::<TestbedError>() {
                        Some(TestbedError::Session(s)) => Some(s),
                        _ => None,
                    }
                });
                match session {
                    Some(SessionError::CommandFailed { .. }) => ErrorSeverity::RemoteCommand,
                    Some(SessionError::Spawn { .. }) => ErrorSeverity::Ssh,
                    _ => ErrorSeverity::Generic,
                }
            }
        }
    }
}

impl From<TestbedError> for TestError {
    fn from(e: TestbedError) -> Self {
        match e {
            TestbedError::Session(SessionError::Timeout { command, timeout }) => {
                TestError::CommandTimeout { command, timeout }
            }
            TestbedError::Session(SessionError::Interrupted { .. }) | TestbedError::Interrupted => {
                TestError::Interrupted
            }
            other => TestError::Fault(other.into()),
        }
    }
}

impl From<SessionError> for TestError {
    fn from(e: SessionError) -> Self {
        TestbedError::from(e).into()
    }
}

impl From<PacketError> for TestError {
    fn from(e: PacketError) -> Self {
        TestError::Fault(e.into())
    }
}

impl From<&TestError> for Fault {
    fn from(e: &TestError) -> Self {
        Fault::new(format!("{:#}", ErrorChain(e)), e.severity())
    }
}

// Renders an error with its sources, like anyhow's alternate format.
struct ErrorChain<'a>(&'a TestError);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TestError::Fault(e) => write!(f, "{:#}", e),
            other => write!(f, "{}", other),
        }
    }
}

/// A test case body.
pub type TestCaseFn<S> = fn(&mut S, &mut SuiteContext<'_>) -> Result<(), TestError>;

pub struct TestCase<S> {
    pub name: &'static str,
    pub func: TestCaseFn<S>,
}

impl<S> TestCase<S> {
    pub const fn new(name: &'static str, func: TestCaseFn<S>) -> Self {
        Self { name, func }
    }
}

impl<S> Clone for TestCase<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for TestCase<S> {}

impl<S> fmt::Debug for TestCase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestCase").field(&self.name).finish()
    }
}

/// A collection of test cases sharing setup and teardown.
///
/// Cases are named `test_*`; `test_perf_*` cases are performance cases and
/// are not functional. Hooks default to doing nothing.
pub trait TestSuite {
    const NAME: &'static str;
    const DESCRIPTION: &'static str = "";
    /// A failing blocking suite aborts the rest of the run.
    const BLOCKING: bool = false;

    /// Every case of the suite, in declaration order.
    fn test_cases(&self) -> Vec<TestCase<Self>>
    where
        Self: Sized;

    fn set_up_suite(&mut self, _ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    fn tear_down_suite(&mut self, _ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    fn set_up_test_case(&mut self, _ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        Ok(())
    }

    fn tear_down_test_case(&mut self, _ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        Ok(())
    }
}

/// Testbed access handed to suite hooks and case bodies.
pub struct SuiteContext<'a> {
    testbed: &'a mut Testbed,
    topology: Topology,
    verifier: PacketVerifier,
    interrupt: Interrupt,
}

impl<'a> SuiteContext<'a> {
    pub fn new(testbed: &'a mut Testbed, topology: Topology, interrupt: Interrupt) -> Self {
        let verifier = PacketVerifier::new(topology.link_addresses());
        Self {
            testbed,
            topology,
            verifier,
            interrupt,
        }
    }

    pub fn sut(&mut self) -> &mut dyn SutNode {
        self.testbed.sut.as_mut()
    }

    pub fn tg(&mut self) -> &mut dyn TgNode {
        self.testbed.tg.as_mut()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn verifier(&self) -> &PacketVerifier {
        &self.verifier
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Fail with `Interrupted` if the operator asked to stop.
    pub fn check_interrupt(&self) -> Result<(), TestError> {
        if self.interrupt.should_stop() {
            return Err(TestError::Interrupted);
        }
        Ok(())
    }

    /// Enable IPv4 forwarding on the SUT and assign the fixed addresses to
    /// all four linked ports, bringing them up. `restore` undoes it.
    pub fn configure_testbed_ipv4(&mut self, restore: bool) -> Result<(), TestError> {
        let delete = restore;
        let enable = !restore;
        let t = &self.topology;
        let sut = self.testbed.sut.as_mut();
        let tg = self.testbed.tg.as_mut();

        sut.configure_ipv4_forwarding(enable)?;
        sut.configure_port_address(&SUT_EGRESS_ADDRESS, &t.sut_egress, delete)?;
        sut.configure_port_state(&t.sut_egress, enable)?;
        sut.configure_port_address(&SUT_INGRESS_ADDRESS, &t.sut_ingress, delete)?;
        sut.configure_port_state(&t.sut_ingress, enable)?;
        tg.configure_port_address(&TG_INGRESS_ADDRESS, &t.tg_ingress, delete)?;
        tg.configure_port_state(&t.tg_ingress, enable)?;
        tg.configure_port_address(&TG_EGRESS_ADDRESS, &t.tg_egress, delete)?;
        tg.configure_port_state(&t.tg_egress, enable)?;
        Ok(())
    }

    /// Address `packet` for the TG -> SUT direction, send it from the TG
    /// egress port and capture on the TG ingress port for `duration`.
    pub fn send_packet_and_capture(
        &mut self,
        packet: &Packet,
        duration: Duration,
    ) -> Result<Vec<Packet>, TestError> {
        self.check_interrupt()?;
        let packet = self.verifier.adjust_addresses(packet, false)?;
        let received = self.testbed.tg.transmit_and_capture(
            &packet,
            &self.topology.tg_egress,
            &self.topology.tg_ingress,
            duration,
        )?;
        Ok(received)
    }

    /// `packet` addressed as it should look after the SUT forwarded it.
    pub fn get_expected_packet(&self, packet: &Packet) -> Result<Packet, TestError> {
        Ok(self.verifier.adjust_addresses(packet, true)?)
    }

    pub fn verify(&self, condition: bool, failure_description: &str) -> Result<(), TestError> {
        if condition {
            return Ok(());
        }
        Err(self.fail_test_case_verify(failure_description))
    }

    /// Fail unless `expected` is among `received`.
    pub fn verify_packets(&self, expected: &Packet, received: &[Packet]) -> Result<(), TestError> {
        if self.verifier.verify_packet_present(expected, received) {
            return Ok(());
        }
        debug!(expected = %expected, "An expected packet not found among received packets");
        for packet in received {
            debug!(received = %packet, "Received packet");
        }
        Err(self.fail_test_case_verify(
            "An expected packet not found among received packets.",
        ))
    }

    fn fail_test_case_verify(&self, description: &str) -> TestError {
        error!(failure = %description, "Test case verification failed");
        debug!("A test case failed, showing the last commands executed on SUT:");
        for command in self.testbed.sut.recent_commands() {
            debug!(node = "SUT", %command);
        }
        debug!("A test case failed, showing the last commands executed on TG:");
        for command in self.testbed.tg.recent_commands() {
            debug!(node = "TG", %command);
        }
        TestError::verify(description)
    }
}

type RunSuiteFn = fn(&Engine, &mut SuiteContext<'_>, &mut TestSuiteResult) -> Result<(), RunAbort>;

/// Registry entry that can instantiate and run one suite type.
#[derive(Clone, Copy)]
pub struct SuiteEntry {
    pub name: &'static str,
    pub description: &'static str,
    run: RunSuiteFn,
}

fn run_default<S: TestSuite + Default>(
    engine: &Engine,
    ctx: &mut SuiteContext<'_>,
    result: &mut TestSuiteResult,
) -> Result<(), RunAbort> {
    let mut suite = S::default();
    engine.run_suite(&mut suite, ctx, result)
}

impl SuiteEntry {
    pub fn of<S: TestSuite + Default>() -> Self {
        Self {
            name: S::NAME,
            description: S::DESCRIPTION,
            run: run_default::<S>,
        }
    }

    pub fn run(
        &self,
        engine: &Engine,
        ctx: &mut SuiteContext<'_>,
        result: &mut TestSuiteResult,
    ) -> Result<(), RunAbort> {
        info!(suite = self.name, "Running test suite");
        (self.run)(engine, ctx, result)
    }
}

impl fmt::Debug for SuiteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteEntry")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testbed_timeout_becomes_command_timeout() {
        let err: TestError = TestbedError::Session(SessionError::Timeout {
            command: "sleep 5".into(),
            timeout: Duration::from_secs(1),
        })
        .into();
        assert!(matches!(err, TestError::CommandTimeout { .. }));
        assert_eq!(err.severity(), ErrorSeverity::Ssh);
    }

    #[test]
    fn test_interrupts_are_recognized() {
        let err: TestError = TestbedError::Interrupted.into();
        assert!(matches!(err, TestError::Interrupted));
        let err: TestError = SessionError::Interrupted {
            command: "x".into(),
        }
        .into();
        assert!(matches!(err, TestError::Interrupted));
    }

    #[test]
    fn test_failed_remote_command_severity() {
        let err: TestError = SessionError::CommandFailed {
            command: "ip link".into(),
            exit_code: 2,
            stderr: "nope".into(),
        }
        .into();
        assert!(matches!(err, TestError::Fault(_)));
        assert_eq!(err.severity(), ErrorSeverity::RemoteCommand);
        let fault = Fault::from(&err);
        assert!(fault.message.contains("ip link"));
    }

    #[test]
    fn test_context_chain_in_fault_message() {
        let err = TestError::Fault(anyhow::anyhow!("root cause").context("starting app"));
        let fault = Fault::from(&err);
        assert_eq!(fault.message, "starting app: root cause");
        assert_eq!(fault.severity, ErrorSeverity::Generic);
    }
}
