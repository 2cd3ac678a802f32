use crate::config::TrainConfig;
use crate::data_loader::{self, Dataset, Scaler, Species, FEATURE_NAMES};
use crate::history::History;
use crate::metrics::{self, Evaluation};
use crate::neural_net::{FitOptions, NeuralNet, Prediction};
use crate::optimizer::Optimizer;
use anyhow::{ensure, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.json";
pub const HISTORY_FILE: &str = "history.csv";
pub const CONFIG_FILE: &str = "config.json";

pub struct Trained {
    pub model: NeuralNet,
    pub history: History,
    pub test: Dataset,
}

/// Load, split, scale, build, compile and fit.
pub fn train(config: &TrainConfig, data: Option<&Path>) -> Result<Trained> {
    config.validate()?;

    let dataset = data_loader::load_iris(data)?;
    let (train, test) =
        data_loader::train_test_split(&dataset, config.test_fraction, config.seed, config.stratify)?;
    let n_classes = Species::ALL.len();
    tracing::info!(
        "Loaded {} samples: {} train {:?} / {} test {:?}",
        dataset.len(),
        train.len(),
        train.class_counts(n_classes),
        test.len(),
        test.class_counts(n_classes)
    );

    let scaler = Scaler::fit(config.scaling, &train.features);
    let mut model = NeuralNet::new(
        dataset.n_features(),
        &config.hidden_sizes,
        config.hidden_activation,
        Species::class_names(),
        scaler,
        config.seed,
    )?;

    let mut options = FitOptions {
        epochs: config.epochs,
        batch_size: config.batch_size,
        optimizer: Optimizer::new(config.optimizer, config.learning_rate),
        patience: config.patience,
        seed: config.seed,
        log_every: config.log_every,
    };
    let history = model.fit(&train, Some(&test), &mut options)?;

    Ok(Trained {
        model,
        history,
        test,
    })
}

/// Writes model, history and config into `output_dir`, returning the model path.
pub fn save_artifacts(trained: &Trained, config: &TrainConfig, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let model_path = output_dir.join(MODEL_FILE);
    trained.model.save(&model_path)?;
    trained.history.write_csv(&output_dir.join(HISTORY_FILE))?;
    config.save(&output_dir.join(CONFIG_FILE))?;
    tracing::info!("Artifacts written to {}", output_dir.display());
    Ok(model_path)
}

pub fn describe_weights(model: &NeuralNet) -> String {
    let mut out = String::new();
    for (i, layer) in model.layers().iter().enumerate() {
        let _ = writeln!(
            out,
            "dense_{} weights ({}x{}):{:.4}",
            i + 1,
            layer.weights.nrows(),
            layer.weights.ncols(),
            layer.weights
        );
        let _ = writeln!(out, "dense_{} biases:{:.4}", i + 1, layer.biases.transpose());
    }
    out
}

pub fn format_prediction(prediction: &Prediction, class_names: &[String]) -> String {
    let probs = class_names
        .iter()
        .zip(&prediction.probabilities)
        .map(|(name, p)| format!("{}={:.4}", name, p))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} ({})", prediction.species, probs)
}

pub struct RunReport {
    pub evaluation: Evaluation,
    pub prediction: Prediction,
    pub reloaded_prediction: Prediction,
    pub model_path: PathBuf,
}

/// The whole walk-through: train, plot, inspect, evaluate, save, reload, predict.
pub fn run(
    config: &TrainConfig,
    data: Option<&Path>,
    output_dir: &Path,
    sample: Option<&[f64]>,
) -> Result<RunReport> {
    let trained = train(config, data)?;

    println!("\nLoss curves:");
    print!("{}", trained.history.render_chart(60, 12));
    if let Some(epoch) = trained.history.stopped_early_at {
        println!("Stopped early at epoch {}", epoch);
    }
    if let Some(best) = trained.history.best_epoch() {
        println!(
            "Lowest validation loss at epoch {}: {:.4}",
            best.epoch,
            best.val_loss.unwrap_or(best.loss)
        );
    }

    println!("\nModel summary:\n{}", trained.model.summary());
    println!("Learned parameters:\n{}", describe_weights(&trained.model));

    let evaluation = metrics::evaluate(&trained.model, &trained.test)?;
    println!("Test loss: {:.4}  Test accuracy: {:.4}", evaluation.loss, evaluation.accuracy);
    println!("\nConfusion matrix:\n{}", evaluation.confusion);
    println!("{}", evaluation.confusion.report());

    let model_path = save_artifacts(&trained, config, output_dir)?;
    let reloaded = NeuralNet::load(&model_path)?;

    let sample: Vec<f64> = match sample {
        Some(s) => s.to_vec(),
        None => trained.test.features.row(0).iter().copied().collect(),
    };
    let prediction = trained.model.predict_one(&sample)?;
    let reloaded_prediction = reloaded.predict_one(&sample)?;
    ensure!(
        prediction.class == reloaded_prediction.class,
        "reloaded model disagrees with the trained model"
    );

    println!(
        "Prediction for {:?}: {}",
        sample,
        format_prediction(&reloaded_prediction, reloaded.class_names())
    );

    Ok(RunReport {
        evaluation,
        prediction,
        reloaded_prediction,
        model_path,
    })
}

/// Scores a saved model on the test split a given seed produces, or on all rows.
pub fn evaluate_saved(
    model_path: &Path,
    data: Option<&Path>,
    split: Option<(f64, u64, bool)>,
) -> Result<Evaluation> {
    let model = NeuralNet::load(model_path)?;
    let dataset = data_loader::load_iris(data)?;
    let target = match split {
        Some((test_fraction, seed, stratify)) => {
            data_loader::train_test_split(&dataset, test_fraction, seed, stratify)?.1
        }
        None => dataset,
    };
    metrics::evaluate(&model, &target)
}

pub fn predict_saved(model_path: &Path, sample: &[f64]) -> Result<(Prediction, Vec<String>)> {
    ensure!(
        sample.len() == FEATURE_NAMES.len(),
        "expected {} measurements ({}), got {}",
        FEATURE_NAMES.len(),
        FEATURE_NAMES.join(", "),
        sample.len()
    );
    let model = NeuralNet::load(model_path)?;
    let prediction = model.predict_one(sample)?;
    Ok((prediction, model.class_names().to_vec()))
}

pub fn inspect_saved(model_path: &Path) -> Result<String> {
    let model = NeuralNet::load(model_path)?;
    Ok(format!(
        "{}\nScaler: {:?}\n\n{}",
        model.summary(),
        model.scaler(),
        describe_weights(&model)
    ))
}
