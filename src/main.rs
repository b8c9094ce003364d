use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use reclink::{
    CachingExecutor, EmTrainer, ParamSnapshot, Row, Settings, SettingsConfig, SqliteBackend,
    TrainedState, UEstimator,
};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Probabilistic record linkage over CSV files
#[derive(Parser, Debug)]
#[command(name = "reclink")]
#[command(about = "Train Fellegi-Sunter record linkage models", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate u probabilities from a random sample of record pairs
    EstimateU {
        #[command(flatten)]
        model: ModelArgs,

        /// Target number of sampled pairs
        #[arg(long, default_value_t = 1_000_000)]
        max_pairs: u64,

        /// Seed for reproducible sampling
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Train λ, m and u by expectation-maximisation
    Train {
        #[command(flatten)]
        model: ModelArgs,

        /// Overrides max_iterations from the settings
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Overrides em_convergence from the settings
        #[arg(long)]
        epsilon: Option<f64>,
    },
    /// Print the model held in a trained-state file
    Show {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Settings document to start from
    #[arg(long, conflicts_with = "state", required_unless_present = "state")]
    settings: Option<PathBuf>,

    /// Trained-state file to resume from
    #[arg(long)]
    state: Option<PathBuf>,

    /// Input CSV files, one table each, named after the file stem
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,

    /// Where to write the trained state
    #[arg(short, long)]
    output: PathBuf,

    /// Replace an existing output file
    #[arg(long)]
    overwrite: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("reclink v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::EstimateU {
            model,
            max_pairs,
            seed,
        } => {
            let start = load_state(&model)?;
            let executor = load_inputs(&model.inputs)?;
            let settings = Settings::from_config(&start.current_params)?;

            let mut estimator = UEstimator::new(&executor, max_pairs);
            if let Some(seed) = seed {
                estimator = estimator.with_seed(seed);
            }
            let (settings, report) = estimator.run(&settings)?;
            info!(
                "Sampled {} of {} candidate pairs (seed {})",
                report.sampled_pairs, report.population, report.seed
            );

            let state = with_estimated_u(start, &settings);
            state.save(&model.output, model.overwrite)?;
            println!("{}", settings);
        }
        Command::Train {
            model,
            max_iterations,
            epsilon,
        } => {
            let start = load_state(&model)?;
            let executor = load_inputs(&model.inputs)?;
            let mut trainer = EmTrainer::from_trained_state(start, &executor)?;
            if let Some(max_iterations) = max_iterations {
                trainer = trainer.with_max_iterations(max_iterations);
            }
            if let Some(epsilon) = epsilon {
                trainer = trainer.with_convergence_epsilon(epsilon);
            }

            let state = trainer.train()?;
            info!(
                "Training finished: {:?} after {} iterations",
                state,
                trainer.iteration()
            );
            let stats = executor.stats();
            info!("Table cache: {} hits, {} misses", stats.hits, stats.misses);

            trainer.to_trained_state().save(&model.output, model.overwrite)?;
            println!("{}", trainer.settings());
        }
        Command::Show { state } => {
            let state = TrainedState::load(&state)?;
            let settings = Settings::from_config(&state.current_params)?;
            println!("Iteration {}", state.iteration);
            println!("{}", settings);
        }
    }

    Ok(())
}

/// Starting point for a command: a saved state, or a fresh settings document
fn load_state(model: &ModelArgs) -> anyhow::Result<TrainedState> {
    if let Some(path) = &model.state {
        return Ok(TrainedState::load(path)?);
    }
    let Some(path) = &model.settings else {
        bail!("either --settings or --state is required");
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    let config: SettingsConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing settings {}", path.display()))?;
    // validate before any input is touched
    Settings::from_config(&config)?;
    Ok(TrainedState {
        current_params: config.clone(),
        historical_params: Vec::new(),
        settings_original: config,
        iteration: 0,
    })
}

/// Record u-estimated parameters in a state. A state that already has a
/// history gets a new snapshot so resumed training continues from it.
fn with_estimated_u(start: TrainedState, settings: &Settings) -> TrainedState {
    let mut state = TrainedState {
        current_params: settings.to_config(),
        ..start
    };
    if !state.historical_params.is_empty() {
        state.iteration += 1;
        state
            .historical_params
            .push(ParamSnapshot::capture(settings, state.iteration));
    }
    state
}

fn load_inputs(paths: &[PathBuf]) -> anyhow::Result<CachingExecutor<SqliteBackend>> {
    let backend = SqliteBackend::open_in_memory()?;
    for path in paths {
        let name = table_name(path)?;
        let rows = read_csv(path)?;
        backend.register_table(&name, &rows)?;
    }
    Ok(CachingExecutor::new(backend))
}

fn table_name(path: &Path) -> anyhow::Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("no file name in {}", path.display()))?;
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    Ok(name)
}

fn read_csv(path: &Path) -> anyhow::Result<Vec<Row>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, field)| (h.to_string(), csv_value(field)))
            .collect();
        rows.push(row);
    }
    info!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Empty fields are NULL; numbers are kept numeric
fn csv_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::from(i);
    }
    if let Some(n) = field.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(field.to_string())
}
