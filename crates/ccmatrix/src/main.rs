//! ccmatrix: congestion-control experiment matrix runner.
//!
//! - `run` provisions, measures and records every cell of the matrix
//! - `plan` prints the cells and the segment each row would land in
//! - `check` verifies privileges and the external tools the config needs

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use ccmatrix::config::{ExperimentConfig, Overrides};
use ccmatrix::dataset::SegmentKey;
use ccmatrix::descriptor::enumerate;
use ccmatrix::shutdown::ShutdownFlag;
use ccmatrix::testbed::NetnsTestbed;
use ccmatrix::Controller;
use ccmatrix_netsim::{check_binary, check_privileges};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// TCP congestion-control experiment matrix.
#[derive(Parser, Debug)]
#[command(name = "ccmatrix", about = "Run TCP congestion-control experiment matrices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole matrix and append rows to the dataset.
    Run(MatrixArgs),
    /// Print the enumerated cells without touching the system.
    Plan(MatrixArgs),
    /// Check privileges and external tools.
    Check {
        /// Config file; decides which tools are required.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct MatrixArgs {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the dataset segments are written to.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Repetitions per algorithm and protocol.
    #[arg(long)]
    repetitions: Option<u32>,

    /// Comma-separated algorithms, e.g. `reno,cubic`.
    #[arg(long, value_delimiter = ',')]
    algorithms: Option<Vec<String>>,

    /// Comma-separated protocols, e.g. `ipv4,ipv6`.
    #[arg(long, value_delimiter = ',')]
    protocols: Option<Vec<String>>,
}

fn load_config(path: Option<&PathBuf>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ExperimentConfig::default()),
    }
}

impl MatrixArgs {
    fn resolve(self) -> Result<ExperimentConfig> {
        let config = load_config(self.config.as_ref())?;
        let config = config
            .with_overrides(Overrides {
                output_dir: self.output_dir,
                repetitions: self.repetitions,
                algorithms: self.algorithms,
                protocols: self.protocols,
            })
            .context("applying command-line overrides")?;
        Ok(config)
    }
}

fn run(args: MatrixArgs) -> Result<u8> {
    let config = args.resolve()?;
    if !check_privileges() {
        anyhow::bail!("network namespaces need root or passwordless sudo (see `ccmatrix check`)");
    }

    let shutdown = ShutdownFlag::new();
    shutdown.install().context("installing signal handler")?;
    let testbed = NetnsTestbed::new(shutdown.handle());

    let mut controller =
        Controller::new(&config, &testbed, shutdown).context("opening dataset directory")?;
    let report = controller.run();

    for segment in &report.segments {
        println!("{}", segment.display());
    }
    println!(
        "{} of {} cells: {} ok, {} degraded, {} failed, {} not persisted",
        report.attempted, report.planned, report.ok, report.degraded, report.failed, report.unpersisted
    );
    if let Some(reason) = &report.stopped {
        println!("stopped early: {reason}");
    }
    Ok(report.exit_code())
}

fn plan(args: MatrixArgs) -> Result<u8> {
    let config = args.resolve()?;
    for descriptor in enumerate(&config) {
        let key = SegmentKey::for_run(&descriptor, config.segment_layout);
        println!(
            "{descriptor}\t{}",
            config.output_dir.join(key.file_name()).display()
        );
    }
    println!("{} cells", config.cell_count());
    Ok(0)
}

fn check(config: Option<PathBuf>) -> Result<u8> {
    let config = load_config(config.as_ref())?;
    let mut missing = 0;

    if check_privileges() {
        println!("ok       privileges (ip netns)");
    } else {
        println!("MISSING  privileges: need root or passwordless sudo");
        missing += 1;
    }

    let mut tools = vec!["ip", "tc", "ss", "sysctl", "modprobe", "ping", config.traffic.tool.binary()];
    if config.capture.enabled {
        tools.push("tcpdump");
        if let Some(query) = config.capture.query.first() {
            tools.push(query.as_str());
        }
    }
    for tool in tools {
        match check_binary(tool) {
            Some(path) => println!("ok       {tool} ({})", path.display()),
            None => {
                println!("MISSING  {tool}");
                missing += 1;
            }
        }
    }
    Ok(if missing == 0 { 0 } else { 1 })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Plan(args) => plan(args),
        Command::Check { config } => check(config),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "ccmatrix failed");
            ExitCode::from(1)
        }
    }
}
