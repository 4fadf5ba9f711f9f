//! Built-in test suites.

pub mod os_udp;

use crate::suite::SuiteEntry;

/// Every suite this binary can run, in default execution order.
pub fn registry() -> Vec<SuiteEntry> {
    vec![SuiteEntry::of::<os_udp::OsUdp>()]
}

pub fn find(name: &str) -> Option<SuiteEntry> {
    registry().into_iter().find(|entry| entry.name == name)
}
