use crate::config::TrainConfig;
use crate::data_loader::Scaling;
use crate::neural_net::Activation;
use crate::optimizer::OptimizerKind;
use crate::pipeline;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "iris-mlp",
    version,
    about = "Train a small multilayer perceptron on the iris dataset, evaluate it and query it."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Full walk-through: train, plot, inspect, evaluate, save, reload and predict
    Run(RunArgs),
    /// Train a model and write it to the output directory
    Train(TrainArgs),
    /// Score a saved model
    Evaluate(EvaluateArgs),
    /// Classify one flower with a saved model
    Predict(PredictArgs),
    /// Print the architecture and learned parameters of a saved model
    Inspect(InspectArgs),
}

/// Training flags. Unset flags keep the value from `--config` or the default.
#[derive(Args, Debug, Default)]
pub struct TrainArgs {
    /// JSON file with a training configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// CSV file with four measurements and a species column; defaults to the built-in table
    #[arg(long)]
    pub data: Option<PathBuf>,

    #[arg(long, default_value = "artifacts")]
    pub output_dir: PathBuf,

    /// Hidden layer widths, e.g. 10,10
    #[arg(long, value_delimiter = ',')]
    pub hidden: Option<Vec<usize>>,

    #[arg(long, value_enum)]
    pub activation: Option<Activation>,

    #[arg(long, value_enum)]
    pub optimizer: Option<OptimizerKind>,

    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub test_fraction: Option<f64>,

    /// Split without preserving class proportions
    #[arg(long)]
    pub no_stratify: bool,

    #[arg(long, value_enum)]
    pub scaling: Option<Scaling>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop after this many epochs without validation improvement
    #[arg(long)]
    pub patience: Option<usize>,

    #[arg(long)]
    pub log_every: Option<usize>,
}

impl TryFrom<&TrainArgs> for TrainConfig {
    type Error = anyhow::Error;

    fn try_from(a: &TrainArgs) -> Result<Self> {
        let mut config = match &a.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(hidden) = &a.hidden {
            config.hidden_sizes = hidden.clone();
        }
        if let Some(v) = a.activation {
            config.hidden_activation = v;
        }
        if let Some(v) = a.optimizer {
            config.optimizer = v;
        }
        if let Some(v) = a.lr {
            config.learning_rate = v;
        }
        if let Some(v) = a.epochs {
            config.epochs = v;
        }
        if let Some(v) = a.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = a.test_fraction {
            config.test_fraction = v;
        }
        if a.no_stratify {
            config.stratify = false;
        }
        if let Some(v) = a.scaling {
            config.scaling = v;
        }
        if let Some(v) = a.seed {
            config.seed = v;
        }
        if let Some(v) = a.patience {
            config.patience = v;
        }
        if let Some(v) = a.log_every {
            config.log_every = v;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub train: TrainArgs,

    /// Measurements to classify at the end, e.g. 5.1,3.5,1.4,0.2; defaults to the first test row
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub sample: Option<Vec<f64>>,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[arg(long, default_value = "artifacts/model.json")]
    pub model: PathBuf,

    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Score every row instead of the held-out split
    #[arg(long)]
    pub all: bool,

    #[arg(long, default_value_t = 0.2)]
    pub test_fraction: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long)]
    pub no_stratify: bool,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(long, default_value = "artifacts/model.json")]
    pub model: PathBuf,

    /// sepal_length sepal_width petal_length petal_width
    #[arg(num_args = 4, required = true, allow_hyphen_values = true)]
    pub measurements: Vec<f64>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(long, default_value = "artifacts/model.json")]
    pub model: PathBuf,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => run_all(args),
            Commands::Train(args) => run_train(args),
            Commands::Evaluate(args) => run_evaluate(args),
            Commands::Predict(args) => run_predict(args),
            Commands::Inspect(args) => run_inspect(args),
        }
    }
}

fn run_all(args: RunArgs) -> Result<()> {
    let config = TrainConfig::try_from(&args.train)?;
    let report = pipeline::run(
        &config,
        args.train.data.as_deref(),
        &args.train.output_dir,
        args.sample.as_deref(),
    )?;
    println!(
        "Test accuracy {:.4}; sample classified as {} before saving and {} after reloading {}",
        report.evaluation.accuracy,
        report.prediction.species,
        report.reloaded_prediction.species,
        report.model_path.display()
    );
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    let config = TrainConfig::try_from(&args)?;
    let trained = pipeline::train(&config, args.data.as_deref())?;
    if let Some(last) = trained.history.last() {
        println!(
            "Final epoch {}: loss={:.4} accuracy={:.4}",
            last.epoch, last.loss, last.accuracy
        );
    }
    let model_path = pipeline::save_artifacts(&trained, &config, &args.output_dir)?;
    println!("Model saved to {}", model_path.display());
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let split = (!args.all).then_some((args.test_fraction, args.seed, !args.no_stratify));
    let evaluation = pipeline::evaluate_saved(&args.model, args.data.as_deref(), split)?;
    println!("Loss: {:.4}  Accuracy: {:.4}", evaluation.loss, evaluation.accuracy);
    println!("\nConfusion matrix:\n{}", evaluation.confusion);
    println!("{}", evaluation.confusion.report());
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let (prediction, names) = pipeline::predict_saved(&args.model, &args.measurements)?;
    println!("{}", pipeline::format_prediction(&prediction, &names));
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    println!("{}", pipeline::inspect_saved(&args.model)?);
    Ok(())
}
