//! # mqsim
//!
//! CLI runner for the mqsim IoT MQTT simulator.

use clap::{Args, Parser, Subcommand, ValueEnum};
use mqsim_metrics::{describe_metrics, metric_defs, MetricKind, MetricsSnapshot};
use mqsim_model::{BuildOptions, ExperimentKind, Scenario};
use mqsim_runner::metrics_export::{self, InMemoryRecorder};
use mqsim_runner::{run_scenario, RunReport, RunnerError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for facade metrics at the end of a run.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// mqsim - IoT MQTT simulator over BLE, Wi-Fi and Zigbee
#[derive(Parser, Debug)]
#[command(name = "mqsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a YAML scenario file
    Run(RunConfig),
    /// Run one of the built-in experiments
    Preset(PresetConfig),
    /// Run several experiments and seeds, one report per run
    Compare(CompareConfig),
    /// List all metrics with descriptions and labels
    Metrics,
}

/// Options shared by every command that runs a simulation.
#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    /// Override the scenario seed
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Override the run length, in seconds
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// Override every node's clean-session flag
    #[arg(long)]
    pub clean_session: Option<bool>,

    /// Write the run report (JSON) here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write every observation as a JSON trace to this file
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Write facade metrics to this file
    #[arg(long)]
    pub metrics_output: Option<PathBuf>,

    /// Format of --metrics-output
    #[arg(long, value_enum, default_value = "json")]
    pub metrics_format: MetricsOutputFormat,
}

/// Configuration for `run`
#[derive(Args, Debug)]
pub struct RunConfig {
    /// Path to the YAML scenario
    pub scenario: PathBuf,

    #[command(flatten)]
    pub options: RunOptions,
}

/// Configuration for `preset`
#[derive(Args, Debug)]
pub struct PresetConfig {
    /// duty-cycle, protocol-comparison or topology-failover
    pub experiment: ExperimentKind,

    /// Write the preset scenario as YAML here and exit without running
    #[arg(long)]
    pub dump_scenario: Option<PathBuf>,

    #[command(flatten)]
    pub options: RunOptions,
}

/// Configuration for `compare`
#[derive(Args, Debug)]
pub struct CompareConfig {
    /// Experiments to run (default: all)
    #[arg(short, long, value_delimiter = ',')]
    pub experiments: Vec<ExperimentKind>,

    /// Seeds to run each experiment with
    #[arg(long, value_delimiter = ',', default_value = "42")]
    pub seeds: Vec<u64>,

    /// Override the run length, in seconds
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// Directory receiving one `<label>-seed<seed>.json` report per run
    #[arg(long)]
    pub output_dir: PathBuf,
}

// ============================================================================
// Commands
// ============================================================================

fn apply_overrides(mut scenario: Scenario, options: &RunOptions) -> Scenario {
    if let Some(seed) = options.seed {
        scenario.seed = seed;
    }
    if let Some(duration) = options.duration {
        scenario.duration_s = duration;
    }
    if let Some(clean_session) = options.clean_session {
        scenario = scenario.with_clean_session(clean_session);
    }
    scenario
}

fn create_file(path: &Path) -> Result<BufWriter<File>, RunnerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn write_report(report: &RunReport, output: Option<&Path>) -> Result<(), RunnerError> {
    match output {
        Some(path) => {
            let mut file = create_file(path)?;
            report.write_json(&mut file)?;
            file.flush()?;
            info!("Report written to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            report.write_json(&mut stdout.lock())?;
        }
    }
    Ok(())
}

fn run_with_options(
    scenario: Scenario,
    experiment: Option<ExperimentKind>,
    options: &RunOptions,
) -> Result<(), RunnerError> {
    let scenario = apply_overrides(scenario, options);
    let trace: Option<Box<dyn Write + Send>> = match &options.trace {
        Some(path) => Some(Box::new(create_file(path)?)),
        None => None,
    };

    let recorder = InMemoryRecorder::new();
    let report = metrics::with_local_recorder(&recorder, || {
        describe_metrics();
        run_scenario(
            &scenario,
            BuildOptions::default(),
            experiment.map(|e| e.label().to_string()),
            trace,
        )
    })?;

    if let Some(path) = &options.metrics_output {
        let export = recorder.export(&report.label, report.duration_s);
        let mut file = create_file(path)?;
        match options.metrics_format {
            MetricsOutputFormat::Json => metrics_export::export_json(&export, &mut file)?,
            MetricsOutputFormat::Prometheus => {
                metrics_export::export_prometheus(&export, &mut file)?
            }
        }
        file.flush()?;
    }

    print_summary(&report.label, &report.snapshot);
    write_report(&report, options.output.as_deref())
}

fn compare(config: CompareConfig) -> Result<(), RunnerError> {
    let experiments = if config.experiments.is_empty() {
        ExperimentKind::ALL.to_vec()
    } else {
        config.experiments.clone()
    };
    std::fs::create_dir_all(&config.output_dir)?;
    for experiment in experiments {
        for &seed in &config.seeds {
            let mut scenario = Scenario::preset(experiment, seed);
            if let Some(duration) = config.duration {
                scenario.duration_s = duration;
            }
            let report = run_scenario(
                &scenario,
                BuildOptions::default(),
                Some(experiment.label().to_string()),
                None,
            )?;
            print_summary(&format!("{} seed {}", report.label, seed), &report.snapshot);
            let path = config
                .output_dir
                .join(format!("{}-seed{}.json", report.label, seed));
            write_report(&report, Some(&path))?;
        }
    }
    Ok(())
}

fn print_summary(title: &str, snapshot: &MetricsSnapshot) {
    eprintln!();
    eprintln!("{}", title);
    eprintln!(
        "┌{}┬{}┬{}┬{}┬{}┬{}┐",
        "─".repeat(10),
        "─".repeat(11),
        "─".repeat(11),
        "─".repeat(9),
        "─".repeat(8),
        "─".repeat(13)
    );
    eprintln!(
        "│ {:^8} │ {:^9} │ {:^9} │ {:^7} │ {:^6} │ {:^11} │",
        "Protocol", "Published", "Delivered", "Ratio", "Dups", "Latency (s)"
    );
    eprintln!(
        "├{}┼{}┼{}┼{}┼{}┼{}┤",
        "─".repeat(10),
        "─".repeat(11),
        "─".repeat(11),
        "─".repeat(9),
        "─".repeat(8),
        "─".repeat(13)
    );
    let rows = snapshot
        .per_protocol
        .iter()
        .map(|(name, stats)| (name.as_str(), stats))
        .chain(std::iter::once(("all", &snapshot.overall)));
    for (name, stats) in rows {
        eprintln!(
            "│ {:8} │ {:>9} │ {:>9} │ {:>7.3} │ {:>6} │ {:>11.3} │",
            name,
            stats.published,
            stats.delivered,
            stats.delivery_ratio,
            stats.duplicates,
            stats.mean_latency_s
        );
    }
    eprintln!(
        "└{}┴{}┴{}┴{}┴{}┴{}┘",
        "─".repeat(10),
        "─".repeat(11),
        "─".repeat(11),
        "─".repeat(9),
        "─".repeat(8),
        "─".repeat(13)
    );
    eprintln!(
        "lost={} in_flight={} queue_drops={} max_queue_depth={} energy={:.2} J sleep_ratio={:.3} restore_time={}",
        snapshot.messages_lost,
        snapshot.in_flight,
        snapshot.queue_drops,
        snapshot.max_broker_queue_depth,
        snapshot.total_energy_j,
        snapshot.mean_sleep_ratio,
        snapshot
            .restore_time_s
            .map(|t| format!("{:.3} s", t))
            .unwrap_or_else(|| "-".to_string())
    );
}

/// Print information about all available metrics
fn print_metrics_info() {
    println!("mqsim Available Metrics");
    println!("=======================\n");

    let categories = [
        ("MQTT", "mqsim.mqtt."),
        ("Broker", "mqsim.broker."),
        ("Radio/MAC", "mqsim.radio."),
    ];
    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL {
            if metric.name.starts_with(prefix) {
                let kind = match metric.kind {
                    MetricKind::Counter => "counter",
                    MetricKind::Gauge => "gauge",
                    MetricKind::Histogram => "histogram",
                };
                println!("  {}", metric.name);
                println!("    Type: {}", kind);
                println!("    Unit: {}", metric.unit.as_str());
                println!("    Description: {}", metric.description);
                println!("    Labels: {}", metric.labels.join(", "));
                println!();
            }
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), RunnerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            let scenario = Scenario::load(&config.scenario)?;
            run_with_options(scenario, None, &config.options)?;
        }
        Commands::Preset(config) => {
            let seed = config.options.seed.unwrap_or(42);
            let scenario = Scenario::preset(config.experiment, seed);
            match &config.dump_scenario {
                Some(path) => {
                    let yaml = apply_overrides(scenario, &config.options).to_yaml()?;
                    std::fs::write(path, yaml)?;
                }
                None => run_with_options(scenario, Some(config.experiment), &config.options)?,
            }
        }
        Commands::Compare(config) => {
            compare(config)?;
        }
        Commands::Metrics => {
            print_metrics_info();
        }
    }

    Ok(())
}
