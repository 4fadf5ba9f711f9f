//! Basic IPv4 forwarding through the SUT's kernel stack.

use crate::packet::Packet;
use crate::suite::{SuiteContext, TestCase, TestError, TestSuite, DEFAULT_CAPTURE_DURATION};

/// Sends one UDP datagram from the TG through the SUT and expects it back on
/// the other TG port.
#[derive(Debug, Default)]
pub struct OsUdp;

impl OsUdp {
    fn test_os_udp(&mut self, ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        let packet = Packet::udp_datagram();
        let received = ctx.send_packet_and_capture(&packet, DEFAULT_CAPTURE_DURATION)?;
        let expected = ctx.get_expected_packet(&packet)?;
        ctx.verify_packets(&expected, &received)
    }
}

impl TestSuite for OsUdp {
    const NAME: &'static str = "os_udp";
    const DESCRIPTION: &'static str = "UDP over IPv4 forwarded by the SUT operating system";

    fn test_cases(&self) -> Vec<TestCase<Self>> {
        vec![TestCase::new("test_os_udp", Self::test_os_udp)]
    }

    fn set_up_suite(&mut self, ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        ctx.configure_testbed_ipv4(false)
    }

    fn tear_down_suite(&mut self, ctx: &mut SuiteContext<'_>) -> Result<(), TestError> {
        ctx.configure_testbed_ipv4(true)
    }
}
