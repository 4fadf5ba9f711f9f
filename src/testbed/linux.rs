//! Linux testbed node driven with iproute2, sysctl and pkill.

use std::time::Duration;

use tracing::{debug, info};

use super::session::{SessionError, ShellSession};
use super::{InterfaceAddress, Node, Port, SutNode, TestbedError};

pub struct LinuxNode {
    name: String,
    ports: Vec<Port>,
    session: ShellSession,
    managed_processes: Vec<String>,
    sudo: bool,
}

impl LinuxNode {
    pub fn new(name: impl Into<String>, ports: Vec<Port>, session: ShellSession) -> Self {
        Self {
            name: name.into(),
            ports,
            session,
            managed_processes: Vec::new(),
            sudo: false,
        }
    }

    /// Process command-line patterns `terminate_managed_processes` kills.
    pub fn with_managed_processes(mut self, patterns: Vec<String>) -> Self {
        self.managed_processes = patterns;
        self
    }

    /// Prefix privileged commands with `sudo -n`.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn session(&self) -> &ShellSession {
        &self.session
    }

    fn privileged(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo -n {}", command)
        } else {
            command.to_string()
        }
    }

    fn run_privileged(&mut self, command: &str) -> Result<(), TestbedError> {
        let command = self.privileged(command);
        self.session.send_command(&command)?;
        Ok(())
    }
}

impl Node for LinuxNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &[Port] {
        &self.ports
    }

    fn configure_port_address(
        &mut self,
        address: &InterfaceAddress,
        port: &Port,
        delete: bool,
    ) -> Result<(), TestbedError> {
        let action = if delete { "del" } else { "add" };
        info!(node = %self.name, port = %port.os_name, %address, action, "Configuring port address");
        self.run_privileged(&format!("ip address {} {} dev {}", action, address, port.os_name))
    }

    fn configure_port_state(&mut self, port: &Port, enabled: bool) -> Result<(), TestbedError> {
        let state = if enabled { "up" } else { "down" };
        info!(node = %self.name, port = %port.os_name, state, "Configuring port state");
        self.run_privileged(&format!("ip link set dev {} {}", port.os_name, state))
    }

    fn recent_commands(&self) -> Vec<String> {
        self.session
            .history()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }
}

impl SutNode for LinuxNode {
    fn configure_ipv4_forwarding(&mut self, enabled: bool) -> Result<(), TestbedError> {
        info!(node = %self.name, enabled, "Configuring IPv4 forwarding");
        let value = u8::from(enabled);
        self.run_privileged(&format!("sysctl -w net.ipv4.ip_forward={}", value))
    }

    fn terminate_managed_processes(&mut self) -> Result<(), TestbedError> {
        let patterns = self.managed_processes.clone();
        for pattern in patterns {
            debug!(node = %self.name, %pattern, "Terminating managed processes");
            let command = self.privileged(&format!("pkill -f {}", shell_quote(&pattern)));
            let result = self
                .session
                .send_command_with(&command, Duration::from_secs(10), false)?;
            // pkill exits 1 when nothing matched.
            if result.exit_code > 1 {
                return Err(SessionError::CommandFailed {
                    command: result.command,
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Wrap `arg` in single quotes for `sh`.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
