//! TOML testbed and run configuration.
//!
//! Layered like the rest of the tool: an explicit `--config` path, else the
//! `DATAPLANERUNNER_CONFIG` environment variable, else
//! `/etc/dataplanerunner/testbed.toml`, else compiled-in defaults. Command
//! line overrides are applied on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::testbed::session::Transport;
use crate::testbed::Port;

pub const CONFIG_ENV: &str = "DATAPLANERUNNER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/dataplanerunner/testbed.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestbedConfig {
    #[serde(default = "NodeConfig::default_sut")]
    pub sut: NodeConfig,
    #[serde(default = "NodeConfig::default_tg")]
    pub tg: NodeConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            sut: NodeConfig::default_sut(),
            tg: NodeConfig::default_tg(),
            run: RunConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TestbedConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded testbed configuration");
        Ok(config)
    }

    /// Load `explicit` if given, failing if it cannot be read. Otherwise
    /// fall back through the environment variable, the system location and
    /// the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `DATAPLANERUNNER_CONFIG` environment variable.
    /// 2. `/etc/dataplanerunner/testbed.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "DATAPLANERUNNER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply command line overrides. Requested test cases are added to the
    /// ones from the file; the other overrides replace file values.
    pub fn apply(&mut self, overrides: &RunOverrides) {
        for case in &overrides.test_cases {
            if !self.run.test_cases.contains(case) {
                self.run.test_cases.push(case.clone());
            }
        }
        if !overrides.suites.is_empty() {
            self.run.suites = overrides.suites.clone();
        }
        if let Some(re_run) = overrides.re_run {
            self.run.re_run = re_run;
        }
        if let Some(dir) = &overrides.output_dir {
            self.run.output_dir = dir.clone();
        }
    }
}

/// Values given on the command line or through their environment variables.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub suites: Vec<String>,
    pub test_cases: Vec<String>,
    pub re_run: Option<u32>,
    pub output_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// One testbed node and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// SSH destination host. Commands run locally when unset.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Run configuration commands through `sudo -n`.
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub ports: Vec<Port>,
    /// Command line patterns of processes to kill after every suite (SUT only).
    #[serde(default)]
    pub managed_processes: Vec<String>,
}

impl NodeConfig {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            user: None,
            sudo: false,
            ports: Vec::new(),
            managed_processes: Vec::new(),
        }
    }

    pub fn default_sut() -> Self {
        Self::named("sut")
    }

    pub fn default_tg() -> Self {
        Self::named("tg")
    }

    pub fn transport(&self) -> Transport {
        match &self.host {
            Some(host) => Transport::Ssh {
                host: host.clone(),
                user: self.user.clone(),
            },
            None => Transport::Local,
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Suites to run, in order. Empty runs every built-in suite.
    pub suites: Vec<String>,
    /// Test cases to run. Empty runs every selected case.
    pub test_cases: Vec<String>,
    /// Extra attempts for a failed test case.
    pub re_run: u32,
    /// Run functional test cases only.
    pub func: bool,
    pub output_dir: PathBuf,
    pub command_timeout_secs: u64,
    /// Number of recent commands kept per node for failure diagnostics.
    pub history_size: usize,
}

impl RunConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            suites: Vec::new(),
            test_cases: Vec::new(),
            re_run: 0,
            func: true,
            output_dir: PathBuf::from("output"),
            command_timeout_secs: 15,
            history_size: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`),
    /// used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
