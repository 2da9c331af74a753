use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use postfire_sweep::{
    aggregate::combine,
    definition::{DuplicatePolicy, ValuePolicy},
    scenarios::{find, selected_definition},
    scoring::EvaluationWindow,
    ConfigGenerator, FsArtifactStore, ProcessInvoker, Scorer, ScoringInput, Settings,
    SweepDefinition, SweepKey, SweepOptions, SweepRunner, SweepTelemetry,
};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "postfire", version, about = "Post-fire recovery parameter sweeps")]
struct Cli {
    /// Settings file (TOML). Defaults to ./postfire.toml when present.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Writes one configuration artifact per definition row.
    Generate(GenerateArgs),
    /// Runs the engine once per generated combination.
    Run(RunArgs),
    /// Scores relocated results and prints the ranking.
    Score(ScoreArgs),
    /// Concatenates relocated results into one table.
    Combine {
        /// Output table (defaults to `[paths] combined`).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generates synthetic spatial input grids.
    Rasters(RasterArgs),
    /// Writes the built-in management scenarios as a definition table.
    Scenarios {
        /// Output table (defaults to `scenarios.csv` in the configs directory).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only write these presets (repeatable).
        #[arg(long = "only", value_name = "NAME")]
        only: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Definition table (defaults to `[paths] definition`).
    #[arg(long)]
    definition: Option<PathBuf>,
    /// Remove the artifacts the definition declares instead of writing them.
    #[arg(long)]
    clean: bool,
    /// Accept non-numeric parameter values.
    #[arg(long)]
    literal_values: bool,
    /// Let later rows replace earlier rows with the same path.
    #[arg(long)]
    allow_duplicates: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only run this combination path or path prefix.
    #[arg(long)]
    only: Option<String>,
    /// List planned invocations without executing anything.
    #[arg(long)]
    dry_run: bool,
    /// Concurrent invocations (defaults to `[sweep] jobs`).
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Args, Debug)]
struct ScoreArgs {
    /// Number of ranked configurations to print.
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Write the full report as JSON.
    #[arg(long)]
    json: Option<PathBuf>,
    /// Evaluate the last N steps.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    trailing: Option<u32>,
    /// First evaluated step (inclusive).
    #[arg(long, requires = "to", allow_negative_numbers = true)]
    from: Option<i64>,
    /// Last evaluated step (inclusive).
    #[arg(long, requires = "from", allow_negative_numbers = true)]
    to: Option<i64>,
}

#[derive(Args, Debug)]
struct RasterArgs {
    /// Output directory (defaults to `[paths] rasters_dir`).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Random seed (random when absent).
    #[arg(long)]
    seed: Option<u64>,
    /// Grid columns.
    #[arg(long)]
    cols: Option<usize>,
    /// Grid rows.
    #[arg(long)]
    rows: Option<usize>,
    /// Cell size in metres.
    #[arg(long)]
    cell_size: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = Settings::load_or_default(cli.settings.as_deref())?;
    tracing::debug!(dir = %settings.source_dir().display(), "settings loaded");
    match cli.command {
        Commands::Generate(args) => handle_generate(&settings, args),
        Commands::Run(args) => handle_run(&settings, args),
        Commands::Score(args) => handle_score(&settings, &args),
        Commands::Combine { output } => handle_combine(&settings, output),
        Commands::Rasters(args) => handle_rasters(&settings, &args),
        Commands::Scenarios { output, only } => handle_scenarios(&settings, output, &only),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn telemetry(settings: &Settings, component: &str) -> Result<SweepTelemetry> {
    let mut builder = SweepTelemetry::builder(component);
    if let Some(log) = &settings.paths.run_log {
        builder = builder.log_path(log);
    }
    builder
        .build()
        .context("failed to open the run log")
}

fn store(settings: &Settings) -> Arc<FsArtifactStore> {
    Arc::new(FsArtifactStore::new(&settings.paths.configs_dir))
}

fn handle_generate(settings: &Settings, args: GenerateArgs) -> Result<()> {
    let path = args
        .definition
        .unwrap_or_else(|| settings.paths.definition.clone());
    let mut options = settings.generation;
    if args.literal_values {
        options.values = ValuePolicy::Literal;
    }
    if args.allow_duplicates {
        options.duplicate_paths = DuplicatePolicy::LastWins;
    }
    let definition = SweepDefinition::load(&path, options)
        .with_context(|| format!("failed to read definition {}", path.display()))?;
    let generator = ConfigGenerator::new(store(settings), Some(telemetry(settings, "generator")?));

    if args.clean {
        let report = generator.clean(&definition)?;
        println!(
            "removed {} artifact(s), {} already absent",
            report.removed.len(),
            report.absent.len()
        );
        return Ok(());
    }

    let report = generator.generate(definition);
    println!(
        "generated {} artifact(s) under {}",
        report.generated.len(),
        settings.paths.configs_dir.display()
    );
    for row in &report.rejected {
        println!(
            "  rejected line {} ({}): {}",
            row.line,
            row.path.as_deref().unwrap_or("-"),
            row.error
        );
    }
    Ok(())
}

fn handle_run(settings: &Settings, args: RunArgs) -> Result<()> {
    let selector = args
        .only
        .as_deref()
        .map(SweepKey::parse)
        .transpose()
        .context("invalid --only selector")?;
    let runner = SweepRunner::builder(store(settings), Arc::new(ProcessInvoker))
        .engine(settings.engine.clone())
        .base_config(&settings.paths.base_config)
        .work_dir(&settings.paths.work_dir)
        .results_dir(&settings.paths.results_dir)
        .telemetry(telemetry(settings, "sweep")?)
        .build()?;
    let options = SweepOptions {
        selector,
        dry_run: args.dry_run,
        jobs: args.jobs.unwrap_or(settings.sweep.jobs),
    };

    if options.dry_run {
        for entry in runner.plan(options.selector.as_ref())? {
            println!("{}", entry.key);
            println!("  config:  {}", entry.merged_config.display());
            println!("  result:  {}", entry.destination.display());
            println!("  command: {}", entry.invocation.command_line());
        }
    }

    let summary = Runtime::new()?.block_on(runner.run(&options))?;
    println!(
        "run {}: planned {}, succeeded {}, failed {}, skipped {}",
        summary.run_id, summary.planned, summary.succeeded, summary.failed, summary.skipped
    );
    if summary.planned == 0 {
        println!("no combinations matched; run `postfire generate` or check --only");
    }
    for failure in summary.failures() {
        println!(
            "  failed {}: {}",
            failure.key,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn handle_score(settings: &Settings, args: &ScoreArgs) -> Result<()> {
    let mut scoring = settings.scoring;
    if let Some(steps) = args.trailing {
        scoring.window = EvaluationWindow::Trailing { steps };
    }
    if let (Some(from), Some(to)) = (args.from, args.to) {
        scoring.window = EvaluationWindow::Range { from, to };
    }
    scoring.validate()?;

    let store = store(settings);
    let inputs = ScoringInput::discover(&*store, &settings.paths.results_dir)
        .context("failed to list combination artifacts")?;
    let report = Scorer::new(scoring, settings.schema.clone())
        .with_telemetry(telemetry(settings, "scorer")?)
        .rank(&inputs);

    println!(
        "{:>4}  {:<32} {:>5}  {:>8} {:>8} {:>8} {:>8}",
        "rank", "configuration", "score", "cv", "density", "ratio", "cover"
    );
    for (idx, scored) in report.top(args.top).iter().enumerate() {
        let m = &scored.metrics;
        println!(
            "{:>4}  {:<32} {:>5}  {:>8.3} {:>8.2} {:>8.2} {:>8.3}",
            idx + 1,
            scored.key.to_string(),
            scored.score.total,
            m.stability_cv,
            m.equilibrium_density,
            m.stratified_ratio,
            m.stratified_cover
        );
    }
    println!(
        "ranked {}, excluded {}",
        report.ranked.len(),
        report.excluded.len()
    );
    for excluded in &report.excluded {
        println!("  excluded {}: {}", excluded.key, excluded.error);
    }
    if let Some(path) = &args.json {
        report.write_json(path)?;
        println!("report written to {}", path.display());
    }
    Ok(())
}

fn handle_combine(settings: &Settings, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| settings.paths.combined.clone());
    let store = store(settings);
    let inputs = ScoringInput::discover(&*store, &settings.paths.results_dir)
        .context("failed to list combination artifacts")?;
    let report = combine(&inputs, &output)?;
    println!(
        "combined {} result(s), {} row(s) into {}",
        report.combined.len(),
        report.rows,
        report.output.display()
    );
    for (key, reason) in &report.skipped {
        println!("  skipped {key}: {reason}");
    }
    Ok(())
}

fn handle_rasters(settings: &Settings, args: &RasterArgs) -> Result<()> {
    let mut plan = settings.rasters;
    if let Some(seed) = args.seed {
        plan.seed = Some(seed);
    }
    if let Some(cols) = args.cols {
        plan.grid.cols = cols;
    }
    if let Some(rows) = args.rows {
        plan.grid.rows = rows;
    }
    if let Some(cell_size) = args.cell_size {
        plan.grid.cell_size = cell_size;
    }
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| settings.paths.rasters_dir.clone());
    let set = plan.generate()?;
    let written = set.write_all(&out)?;
    println!(
        "seed {} ({}x{} cells of {} m)",
        set.seed, plan.grid.cols, plan.grid.rows, plan.grid.cell_size
    );
    for path in written {
        println!("  wrote {}", path.display());
    }
    Ok(())
}

fn handle_scenarios(settings: &Settings, output: Option<PathBuf>, only: &[String]) -> Result<()> {
    let output = output.unwrap_or_else(|| default_scenarios_path(&settings.paths.configs_dir));
    let definition = selected_definition(only)?;
    definition.write_csv(&output)?;
    for combination in &definition.combinations {
        if let Some(scenario) = find(&combination.key.to_string()) {
            println!("{:<14} {}", scenario.name, scenario.label);
        }
    }
    println!("definition written to {}", output.display());
    Ok(())
}

fn default_scenarios_path(configs_dir: &Path) -> PathBuf {
    configs_dir.join("scenarios.csv")
}
