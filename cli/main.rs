#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, value_parser};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use loanwise::batch::{default_export_name, run_batch, summarize, write_results};
use loanwise::data::load_training_data;
use loanwise::forest::{ForestConfig, MAX_SEED};
use loanwise::model::{TrainingConfig, TrainingObserver, TrainingStage};
use loanwise::store;
use loanwise::{ApplicationRecord, Predictor, PredictorError};

const DEFAULT_MODEL_DIR: &str = "models";

#[derive(Args)]
pub struct TrainArgs {
    /// Path to the labeled training CSV (must include a Loan_Status column)
    pub training_data: PathBuf,

    /// Directory the model artifacts are written to
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    /// Number of trees in the forest
    #[arg(long, default_value = "100")]
    pub trees: usize,

    /// Maximum depth of each tree
    #[arg(long, default_value = "10")]
    pub max_depth: usize,

    /// Minimum number of samples required to split a node
    #[arg(long, default_value = "5")]
    pub min_samples_split: usize,

    /// Minimum number of samples in each leaf
    #[arg(long, default_value = "2")]
    pub min_samples_leaf: usize,

    /// Features examined per split (default: square root of the feature count)
    #[arg(long, value_name = "N")]
    pub max_features: Option<usize>,

    /// Seed for bootstrap sampling and feature selection
    #[arg(long, default_value = "42", value_parser = value_parser!(u64).range(..=MAX_SEED))]
    pub seed: u64,

    /// Fraction of rows held out for evaluation
    #[arg(long, default_value = "0.2")]
    pub test_fraction: f64,

    /// Seed for the stratified train/held-out split
    #[arg(long, default_value = "42", value_parser = value_parser!(u64).range(..=MAX_SEED))]
    pub split_seed: u64,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Directory holding the model artifacts
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    /// The application as a JSON object, e.g. '{"Gender": "Male", "LoanAmount": 150}'
    #[arg(long, value_name = "OBJECT", conflicts_with_all = [
        "gender", "married", "dependents", "education", "self_employed",
        "applicant_income", "coapplicant_income", "loan_amount",
        "loan_amount_term", "credit_history", "property_area",
    ])]
    pub json: Option<String>,

    #[arg(long)]
    pub gender: Option<String>,
    #[arg(long)]
    pub married: Option<String>,
    #[arg(long)]
    pub dependents: Option<String>,
    #[arg(long)]
    pub education: Option<String>,
    #[arg(long)]
    pub self_employed: Option<String>,
    #[arg(long)]
    pub applicant_income: Option<f64>,
    #[arg(long)]
    pub coapplicant_income: Option<f64>,
    #[arg(long)]
    pub loan_amount: Option<f64>,
    /// Loan term in months
    #[arg(long)]
    pub loan_amount_term: Option<f64>,
    /// 1.0 for a clean credit history, 0.0 otherwise
    #[arg(long)]
    pub credit_history: Option<f64>,
    #[arg(long)]
    pub property_area: Option<String>,
}

impl PredictArgs {
    fn record(&self) -> Result<ApplicationRecord, Box<dyn std::error::Error>> {
        if let Some(json) = &self.json {
            return Ok(ApplicationRecord::from_json(json)?);
        }
        Ok(ApplicationRecord {
            loan_id: None,
            gender: self.gender.clone(),
            married: self.married.clone(),
            dependents: self.dependents.clone(),
            education: self.education.clone(),
            self_employed: self.self_employed.clone(),
            applicant_income: self.applicant_income,
            coapplicant_income: self.coapplicant_income,
            loan_amount: self.loan_amount,
            loan_amount_term: self.loan_amount_term,
            credit_history: self.credit_history,
            property_area: self.property_area.clone(),
        })
    }
}

#[derive(Parser)]
#[command(
    name = "loanwise",
    about = "Loan-approval prediction with a seeded random forest",
    long_about = "Trains a random forest on historical loan applications and scores \
                 new applications, one at a time or in batches."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a labeled CSV file
    #[command(about = "Train a model (outputs: five TOML artifacts in --model-dir)")]
    Train(TrainArgs),

    /// Score a single application
    #[command(about = "Score one application and print the result as JSON")]
    Predict(PredictArgs),

    /// Score every row of a CSV file
    #[command(about = "Score a CSV file of applications (outputs: predictions CSV)")]
    Batch {
        /// Path to the CSV file of applications
        #[arg(value_name = "CSV_PATH")]
        input: PathBuf,

        /// Directory holding the model artifacts
        #[arg(long, default_value = DEFAULT_MODEL_DIR)]
        model_dir: PathBuf,

        /// Where to write the results (default: batch_predictions_<timestamp>.csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the held-out metrics of the trained model
    #[command(about = "Print model metrics as JSON")]
    Info {
        #[arg(long, default_value = DEFAULT_MODEL_DIR)]
        model_dir: PathBuf,
    },

    /// List the model's input features in order
    #[command(about = "Print the feature columns as JSON")]
    Features {
        #[arg(long, default_value = DEFAULT_MODEL_DIR)]
        model_dir: PathBuf,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

/// Reports training stages with one spinner per stage on stderr.
struct SpinnerObserver {
    active: Option<ProgressBar>,
}

impl SpinnerObserver {
    fn new() -> Self {
        Self { active: None }
    }
}

impl TrainingObserver for SpinnerObserver {
    fn on_stage_start(&mut self, stage: TrainingStage, samples: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{stage} ({samples} samples)"));
        pb.enable_steady_tick(Duration::from_millis(100));
        self.active = Some(pb);
    }

    fn on_stage_finish(&mut self, stage: TrainingStage) {
        if let Some(pb) = self.active.take() {
            pb.finish_and_clear();
        }
        println!("Finished {stage}.");
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Loading training data from: {}",
        args.training_data.display()
    );
    let data = load_training_data(&args.training_data)?;
    println!("Loaded {} applications", data.len());

    let config = TrainingConfig {
        forest: ForestConfig {
            n_trees: args.trees,
            max_depth: args.max_depth,
            min_samples_split: args.min_samples_split,
            min_samples_leaf: args.min_samples_leaf,
            seed: args.seed,
            max_features: args.max_features,
        },
        test_fraction: args.test_fraction,
        split_seed: args.split_seed,
    };

    if store::artifacts_present(&args.model_dir) {
        log::info!(
            "An existing model in '{}' will be replaced",
            args.model_dir.display()
        );
    }

    let mut predictor = Predictor::new();
    let metrics = predictor.train(&data, &config, &mut SpinnerObserver::new())?;
    println!("Held-out accuracy: {:.4}", metrics.accuracy);
    println!("Held-out ROC-AUC:  {:.4}", metrics.roc_auc);
    if let Some(top) = metrics.feature_importance.first() {
        println!(
            "Most important feature: {} ({:.4})",
            top.feature, top.importance
        );
    }

    predictor.save(&args.model_dir)?;
    println!("Model saved to: {}", args.model_dir.display());
    Ok(())
}

/// Loads the model under `model_dir`. A directory that does not exist means no
/// model has been trained yet.
fn load_predictor(model_dir: &Path) -> Result<Predictor, Box<dyn std::error::Error>> {
    if !model_dir.is_dir() {
        log::warn!("Model directory '{}' does not exist", model_dir.display());
        return Err(PredictorError::NotReady.into());
    }
    let mut predictor = Predictor::new();
    predictor.load(model_dir)?;
    Ok(predictor)
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let record = args.record()?;
    let predictor = load_predictor(&args.model_dir)?;
    let prediction = predictor.predict(&record)?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

fn batch(
    input: PathBuf,
    model_dir: PathBuf,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let predictor = load_predictor(&model_dir)?;
    println!("Scoring applications from: {}", input.display());
    let entries = run_batch(&predictor, &input)?;

    let output = output.unwrap_or_else(|| PathBuf::from(default_export_name()));
    write_results(&entries, &output)?;

    let summary = summarize(&entries);
    println!(
        "Scored {} rows: {} approved, {} rejected, {} errors",
        summary.total, summary.approved, summary.rejected, summary.errors
    );
    println!("Results saved to: {}", output.display());
    Ok(())
}

fn info(model_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let predictor = load_predictor(&model_dir)?;
    println!("{}", serde_json::to_string_pretty(predictor.metrics()?)?);
    Ok(())
}

fn features(model_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let predictor = load_predictor(&model_dir)?;
    let columns = predictor.feature_columns()?;
    let listing = serde_json::json!({
        "features": columns,
        "count": columns.len(),
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Batch {
            input,
            model_dir,
            output,
        }) => batch(input, model_dir, output),
        Some(Commands::Info { model_dir }) => info(model_dir),
        Some(Commands::Features { model_dir }) => features(model_dir),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const YEAR: u64 = 365 * DAY;

    let (value, unit) = match seconds {
        s if s < MINUTE => return format!("{s} seconds ago"),
        s if s < HOUR => (s as f64 / MINUTE as f64, "minutes"),
        s if s < DAY => (s as f64 / HOUR as f64, "hours"),
        s if s < WEEK => (s as f64 / DAY as f64, "days"),
        s if s < YEAR => (s as f64 / WEEK as f64, "weeks"),
        s => (s as f64 / YEAR as f64, "years"),
    };
    format!("{value:.1} {unit} ago")
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("LOANWISE_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("loanwise {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match now.checked_sub(build_timestamp) {
            Some(age) if age > 0 => println!("Built: {}", format_duration_ago(age)),
            _ => println!("Built: just now"),
        }
    }
}
