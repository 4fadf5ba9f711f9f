use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dataplanerunner::config::{LoggingConfig, RunOverrides, TestbedConfig};
use dataplanerunner::result::{report, ErrorSeverity};
use dataplanerunner::Interrupt;

#[derive(Parser)]
#[command(
    name = "dataplanerunner",
    about = "Functional dataplane tests between a SUT and a traffic generator",
    version,
    long_about = None
)]
struct Cli {
    /// Testbed configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test suites against the configured testbed
    Run {
        /// Suite to run, repeatable (default: the config file's list, else all)
        #[arg(long = "suite")]
        suites: Vec<String>,

        /// Comma separated test cases to run, added to the config file's list
        #[arg(long, env = "DATAPLANERUNNER_TESTCASES", value_delimiter = ',')]
        test_cases: Vec<String>,

        /// Extra attempts for a failed test case
        #[arg(long, env = "DATAPLANERUNNER_RERUN")]
        re_run: Option<u32>,

        /// Directory for statistics.txt and results.json
        #[arg(long, env = "DATAPLANERUNNER_OUTPUT_DIR")]
        output: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List the built-in test suites
    ListSuites,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(ErrorSeverity::Generic.code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::ListSuites => {
            init_tracing(&LoggingConfig::default().level, cli.log_json);
            for entry in dataplanerunner::suites::registry() {
                println!("{:<16} {}", entry.name, entry.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            suites,
            test_cases,
            re_run,
            output,
            json,
        } => {
            let mut config = match TestbedConfig::resolve(cli.config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    return Ok(ExitCode::from(ErrorSeverity::Config.code()));
                }
            };
            init_tracing(&config.logging.level, cli.log_json);
            config.apply(&RunOverrides {
                suites,
                test_cases,
                re_run,
                output_dir: output,
            });

            let interrupt = Interrupt::new();
            let signal = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping after the current teardown");
                    signal.raise();
                }
            });

            let run_config = config.clone();
            let result = tokio::task::spawn_blocking(move || {
                dataplanerunner::run(&run_config, interrupt)
            })
            .await
            .context("test run task failed")?;

            let stats_path = report::write_report(&result, &config.run.output_dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", report::format_summary(&result));
                println!("Statistics written to {}", stats_path.display());
            }
            Ok(ExitCode::from(result.return_code().code()))
        }
    }
}
