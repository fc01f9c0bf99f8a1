//! CLI for comparing and replicating flow records.

use clap::{ArgAction, Args, Parser, Subcommand};
use flowval_analyzer::config::{self, ModelOptions, ReplicateOptions, RuleSet, DEFAULT_LOOPS, DEFAULT_SPEED_MULTIPLIER};
use flowval_analyzer::error::{exit_code, CliError};
use flowval_analyzer::logger::{SharedLogger, StderrLogger, Verbosity};
use flowval_analyzer::metric::GeneratorStats;
use flowval_analyzer::model::{precise_rules, ComparisonEngine};
use flowval_analyzer::replicator::ReplicationEngine;
use flowval_analyzer::summary::Summary;
use flowval_analyzer::FlowDataset;
use ipnetwork::IpNetwork;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "flowval")]
#[command(version, about = "Validate flow exporter output against reference flows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare probe flows with reference flows
    Compare(CompareArgs),
    /// Expand a reference flow list over replay loops
    Replicate(ReplicateArgs),
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// CSV file with flows exported by the probe
    #[arg(long)]
    flows: PathBuf,

    /// CSV file with reference flows
    #[arg(long)]
    reference: PathBuf,

    /// JSON file with traffic generator statistics
    #[arg(long)]
    stats: Option<PathBuf>,

    /// YAML or JSON rule file
    #[arg(long, required_unless_present = "precise", conflicts_with = "precise")]
    rules: Option<PathBuf>,

    /// Use zero tolerance for every metric instead of a rule file
    ///
    /// Rate metrics are included, so generator statistics are required.
    #[arg(long, default_value_t = false, requires = "stats")]
    precise: bool,

    /// Probe prefilter subnets, one precise rule per subnet (repeatable)
    #[arg(long, action = ArgAction::Append, requires = "precise")]
    prefilter: Vec<String>,

    /// Merge probe flows with the same flow key
    #[arg(long, default_value_t = config::DEFAULT_MERGE)]
    merge: bool,

    /// Align timestamps of both directions of merged biflows
    #[arg(long = "biflows", default_value_t = config::DEFAULT_BIFLOW_TS_CORRECTION)]
    biflow_ts_correction: bool,

    /// Treat reference timestamps as offsets from the generator start
    #[arg(long, default_value_t = config::DEFAULT_ALIGN_REFERENCE)]
    align_reference: bool,

    /// Also check that no flows fall outside every rule segment
    #[arg(long, default_value_t = false)]
    check_complement: bool,

    /// Write the Markdown report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write the JSON summary here
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Increase verbosity (-v for progress, -vv for debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug)]
struct ReplicateArgs {
    /// CSV file with the recorded flows of one loop
    #[arg(long)]
    input: PathBuf,

    /// YAML or JSON replicator configuration (identity when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of replay loops
    #[arg(long, default_value_t = DEFAULT_LOOPS)]
    loops: u32,

    /// Output CSV file
    #[arg(long)]
    out: PathBuf,

    /// Merge flows with the same key across loop boundaries
    #[arg(long, default_value_t = false)]
    merge_across_loops: bool,

    /// Probe inactive timeout in milliseconds, used with --merge-across-loops
    #[arg(long, requires = "merge_across_loops")]
    inactive_timeout_ms: Option<u64>,

    /// Replay speed multiplier
    #[arg(long = "speed", default_value_t = DEFAULT_SPEED_MULTIPLIER)]
    speed_multiplier: f64,

    /// Loop index excluded from replication (repeatable)
    #[arg(long = "ignore-loop", action = ArgAction::Append)]
    ignore_loops: Vec<u32>,

    /// Increase verbosity (-v for progress, -vv for debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Compare(args) => run_compare(args),
        Command::Replicate(args) => run_replicate(args),
    }
}

fn make_logger(verbose: u8) -> SharedLogger {
    Arc::new(StderrLogger::new(Verbosity::from_count(verbose)))
}

fn run_compare(args: CompareArgs) -> Result<(), CliError> {
    let logger = make_logger(args.verbose);

    // 1. Resolve rules before touching the datasets
    let rule_set = if args.precise {
        let prefilter = parse_prefilter(&args.prefilter)?;
        RuleSet {
            check_complement: !prefilter.is_empty() || args.check_complement,
            rules: precise_rules(&prefilter),
        }
    } else {
        let path = args
            .rules
            .as_deref()
            .ok_or_else(|| CliError::InvalidArgument("either --rules or --precise is required".into()))?;
        let mut rule_set = RuleSet::load(path)?;
        rule_set.check_complement |= args.check_complement;
        rule_set
    };
    logger.verbose(&format!("loaded {} rules", rule_set.rules.len()));

    // 2. Load inputs
    let flows = FlowDataset::load_csv(&args.flows, logger.as_ref())?;
    let reference = FlowDataset::load_csv(&args.reference, logger.as_ref())?;
    let stats = match &args.stats {
        Some(path) => config::load_generator_stats(path)?,
        None => GeneratorStats::default(),
    };

    // 3. Compare
    let options = ModelOptions::default()
        .with_merge(args.merge)
        .with_biflow_ts_correction(args.biflow_ts_correction)
        .with_reference_alignment(args.align_reference);
    let engine = ComparisonEngine::new(flows, reference, stats, &options, logger.clone())?;
    let report = engine.validate(&rule_set.rules, rule_set.check_complement)?;

    // 4. Write outputs
    let markdown = report.render_markdown();
    match &args.report {
        Some(path) => write_file(path, &markdown)?,
        None => print!("{markdown}"),
    }
    if let Some(path) = &args.summary {
        let json = Summary::from_report(&report).to_json()?;
        write_file(path, &json)?;
    }

    let failed = report.failed().count();
    if failed > 0 {
        return Err(CliError::TestsFailed {
            failed,
            total: report.len(),
        });
    }
    logger.info(&format!("all {} tests passed", report.len()));
    Ok(())
}

fn run_replicate(args: ReplicateArgs) -> Result<(), CliError> {
    let logger = make_logger(args.verbose);

    let replicator_config = match &args.config {
        Some(path) => config::load_replicator_config(path)?,
        None => serde_json::Value::Null,
    };
    let engine = ReplicationEngine::new(&replicator_config, &args.ignore_loops, logger.clone())?;

    let input = FlowDataset::load_csv(&args.input, logger.as_ref())?;
    let options = ReplicateOptions::new(args.loops)
        .with_merge_across_loops(args.merge_across_loops)
        .with_inactive_timeout_ms(args.inactive_timeout_ms)
        .with_speed_multiplier(args.speed_multiplier);
    let replicated = engine.replicate(&input, &options)?;

    replicated.save_csv(&args.out)?;
    logger.info(&format!(
        "wrote {} flows to {}",
        replicated.len(),
        args.out.display()
    ));
    Ok(())
}

fn parse_prefilter(subnets: &[String]) -> Result<Vec<IpNetwork>, CliError> {
    subnets
        .iter()
        .map(|s| {
            s.parse::<IpNetwork>()
                .map_err(|e| CliError::InvalidArgument(format!("invalid prefilter subnet '{s}': {e}")))
        })
        .collect()
}

fn write_file(path: &Path, content: &str) -> Result<(), CliError> {
    std::fs::write(path, content).map_err(|source| CliError::Write {
        path: path.display().to_string(),
        source,
    })
}
