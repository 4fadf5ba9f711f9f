//! Shell command sessions to testbed nodes, local or over `ssh`.
//!
//! Each session keeps a bounded history of the commands it ran so a failing
//! test can show what was last executed on the node.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::interrupt::Interrupt;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command '{command}' exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command '{command}' interrupted by operator")]
    Interrupted { command: String },
}

/// Output of one finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Fixed-capacity ring buffer of the most recent commands.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<CommandResult>,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, result: CommandResult) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CommandResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Where commands are executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Transport {
    /// `sh -c` on this host.
    Local,
    /// Non-interactive `ssh` to `host`.
    Ssh { host: String, user: Option<String> },
}

pub struct ShellSession {
    name: String,
    transport: Transport,
    timeout: Duration,
    history: CommandHistory,
    interrupt: Interrupt,
}

impl ShellSession {
    pub fn new(
        name: impl Into<String>,
        transport: Transport,
        timeout: Duration,
        history_size: usize,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout,
            history: CommandHistory::new(history_size),
            interrupt,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    /// Run `command` with the session timeout and fail on a non-zero exit.
    pub fn send_command(&mut self, command: &str) -> Result<CommandResult, SessionError> {
        self.send_command_with(command, self.timeout, true)
    }

    /// Run `command`, killing it after `timeout`. With `verify` a non-zero
    /// exit code is an error; without it the result is returned as is.
    pub fn send_command_with(
        &mut self,
        command: &str,
        timeout: Duration,
        verify: bool,
    ) -> Result<CommandResult, SessionError> {
        debug!(session = %self.name, %command, "Sending command");
        let outcome = self
            .spawn(command)
            .map_err(|source| SessionError::Spawn {
                command: command.to_string(),
                source,
            })
            .and_then(|child| self.wait(child, command, timeout));
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.history.push(CommandResult {
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                });
                return Err(e);
            }
        };
        self.history.push(result.clone());

        if verify && result.exit_code != 0 {
            warn!(
                session = %self.name,
                %command,
                exit_code = result.exit_code,
                "Command failed"
            );
            return Err(SessionError::CommandFailed {
                command: result.command,
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }

    fn spawn(&self, command: &str) -> io::Result<Child> {
        let mut cmd = match &self.transport {
            Transport::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Transport::Ssh { host, user } => {
                let destination = match user {
                    Some(user) => format!("{}@{}", user, host),
                    None => host.clone(),
                };
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"])
                    .arg(destination)
                    .arg("--")
                    .arg(command);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn wait(&self, mut child: Child, command: &str, timeout: Duration) -> Result<CommandResult, SessionError> {
        let spawn_err = |source| SessionError::Spawn {
            command: command.to_string(),
            source,
        };
        // Pipes are drained while the child runs.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(spawn_err)? {
                break status;
            }
            // Readers stay detached after a kill; orphans may hold the pipes.
            if self.interrupt.should_stop() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Interrupted {
                    command: command.to_string(),
                });
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandResult {
            command: command.to_string(),
            stdout: collect(stdout),
            stderr: collect(stderr),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn collect(reader: JoinHandle<Vec<u8>>) -> String {
    let bytes = reader.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(command: &str) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn local(history_size: usize) -> ShellSession {
        ShellSession::new(
            "local",
            Transport::Local,
            Duration::from_secs(5),
            history_size,
            Interrupt::new(),
        )
    }

    #[test]
    fn test_history_keeps_latest_entries() {
        let mut history = CommandHistory::new(3);
        for cmd in ["a", "b", "c", "d", "e"] {
            history.push(result(cmd));
        }
        let commands: Vec<_> = history.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["c", "d", "e"]);
        assert_eq!(history.len(), history.capacity());
    }

    #[test]
    fn test_zero_capacity_history_stays_empty() {
        let mut history = CommandHistory::new(0);
        history.push(result("a"));
        assert!(history.is_empty());
    }

    #[test]
    fn test_local_command_output() {
        let mut session = local(10);
        let res = session.send_command("echo hello").unwrap();
        assert_eq!(res.stdout.trim(), "hello");
        assert_eq!(res.exit_code, 0);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_non_zero_exit_is_reported_when_verified() {
        let mut session = local(10);
        let err = session.send_command("echo oops >&2; exit 3").unwrap_err();
        match err {
            SessionError::CommandFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let res = session
            .send_command_with("exit 1", Duration::from_secs(5), false)
            .unwrap();
        assert_eq!(res.exit_code, 1);
        assert_eq!(session.history().len(), 2);
    }

    #[test]
    fn test_slow_command_times_out() {
        let mut session = local(10);
        let err = session
            .send_command_with("sleep 5", Duration::from_millis(100), true)
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        // The timed out command still shows up in the diagnostics.
        let last = session.history().iter().last().unwrap();
        assert_eq!(last.command, "sleep 5");
        assert_eq!(last.exit_code, -1);
    }

    #[test]
    fn test_large_output_does_not_stall() {
        let mut session = local(10);
        let res = session
            .send_command_with(
                "head -c 200000 /dev/zero | tr '\\0' a; echo done >&2",
                Duration::from_secs(5),
                true,
            )
            .unwrap();
        assert_eq!(res.stdout.len(), 200_000);
        assert!(res.stdout.bytes().all(|b| b == b'a'));
        assert_eq!(res.stderr.trim(), "done");
    }

    #[test]
    fn test_interrupt_stops_command() {
        let interrupt = Interrupt::new();
        let mut session = ShellSession::new(
            "local",
            Transport::Local,
            Duration::from_secs(5),
            10,
            interrupt.clone(),
        );
        interrupt.raise();
        let err = session.send_command("sleep 5").unwrap_err();
        assert!(matches!(err, SessionError::Interrupted { .. }));
        assert_eq!(session.history().len(), 1);

        // Shielded commands still run.
        let res = interrupt.shielded(|| session.send_command("true"));
        assert!(res.is_ok());
    }
}
