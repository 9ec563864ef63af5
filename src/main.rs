use clap::{Parser, Subcommand};
use pmem_probe::config::ProbeConfig;
use pmem_probe::profiler::PerfRelay;
use pmem_probe::{measure, DerivedMetrics, FileSource, IpmctlSource, SessionOptions, SnapshotSource, StaticSource};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Snapshot persistent-memory DIMM counters around a workload and report
/// controller/media bandwidth and read/write amplification.
#[derive(Parser, Debug)]
#[command(name = "pmem-probe", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "pmem-probe.toml")]
    config: PathBuf,

    /// Extra logging (capture commands, N/A decisions, poller lifecycle)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress the report table
    #[arg(short, long)]
    quiet: bool,

    /// Print derived metrics as JSON on stdout
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Difference two saved counter dumps
    Diff { start: PathBuf, end: PathBuf },
    /// Capture counters, run a workload, capture again
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        workload: Vec<String>,
    },
    /// Print the resolved configuration and exit
    ShowConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(metrics: &DerivedMetrics) {
    match serde_json::to_string_pretty(metrics) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize metrics"),
    }
}

fn run_diff(start: PathBuf, end: PathBuf, options: SessionOptions) -> Result<DerivedMetrics, String> {
    let start = FileSource::new(start).capture().map_err(|e| e.to_string())?;
    let end = FileSource::new(end).capture().map_err(|e| e.to_string())?;
    let (_, metrics) = measure(StaticSource::new([start, end]), options, || ())
        .map_err(|e| e.to_string())?;
    Ok(metrics)
}

fn run_workload(
    config: &ProbeConfig,
    workload: &[String],
    options: SessionOptions,
) -> Result<(DerivedMetrics, bool), String> {
    let relay = PerfRelay::detect();
    let source = IpmctlSource::from_config(&config.capture);

    let (status, metrics) = measure(source, options, || {
        if let Err(e) = relay.switch() {
            tracing::warn!(error = %e, "failed to signal perf");
        }
        let status = std::process::Command::new(&workload[0])
            .args(&workload[1..])
            .status();
        if let Err(e) = relay.stop() {
            tracing::warn!(error = %e, "failed to stop perf");
        }
        status
    })
    .map_err(|e| e.to_string())?;

    let status = status.map_err(|e| format!("failed to run {}: {e}", workload[0]))?;
    if !status.success() {
        tracing::warn!(exit_code = ?status.code(), "workload exited unsuccessfully");
    }
    Ok((metrics, status.success()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match ProbeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let report = config.report.enabled && !cli.quiet;
    let result = match cli.command {
        Command::ShowConfig => {
            println!("{config:#?}");
            return ExitCode::SUCCESS;
        }
        Command::Diff { start, end } => {
            let options = SessionOptions::new("diff")
                .with_report(report)
                .without_elapsed();
            run_diff(start, end, options).map(|m| (m, true))
        }
        Command::Run { workload } => {
            let options = SessionOptions::new(workload.join(" ")).with_report(report);
            run_workload(&config, &workload, options)
        }
    };

    match result {
        Ok((metrics, success)) => {
            if cli.json {
                print_json(&metrics);
            }
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "measurement failed");
            ExitCode::FAILURE
        }
    }
}
