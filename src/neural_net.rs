use crate::data_loader::{Dataset, Scaler};
use crate::history::{EpochMetrics, History};
use crate::optimizer::Optimizer;
use anyhow::{bail, ensure, Context, Result};
use clap::ValueEnum;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f64 = 1e-7;

// Matrices are stored row-major so the JSON reads like the printed weights.
fn serialize_dmatrix<S>(matrix: &DMatrix<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let row_major: Vec<f64> = (0..matrix.nrows())
        .flat_map(|i| (0..matrix.ncols()).map(move |j| matrix[(i, j)]))
        .collect();
    let mut state = serializer.serialize_struct("DMatrix", 3)?;
    state.serialize_field("data", &row_major)?;
    state.serialize_field("nrows", &matrix.nrows())?;
    state.serialize_field("ncols", &matrix.ncols())?;
    state.end()
}

fn deserialize_dmatrix<'de, D>(deserializer: D) -> Result<DMatrix<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct DMatrixData {
        data: Vec<f64>,
        nrows: usize,
        ncols: usize,
    }

    let helper = DMatrixData::deserialize(deserializer)?;
    if helper.data.len() != helper.nrows * helper.ncols {
        return Err(serde::de::Error::custom(format!(
            "matrix data has {} values, expected {}x{}",
            helper.data.len(),
            helper.nrows,
            helper.ncols
        )));
    }
    Ok(DMatrix::from_row_slice(helper.nrows, helper.ncols, &helper.data))
}

fn serialize_dvector<S>(vector: &DVector<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    vector.as_slice().serialize(serializer)
}

fn deserialize_dvector<'de, D>(deserializer: D) -> Result<DVector<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let data: Vec<f64> = Vec::deserialize(deserializer)?;
    Ok(DVector::from_vec(data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    /// Output layer only; paired with cross-entropy in `backward`.
    #[value(skip)]
    Softmax,
}

impl Activation {
    pub fn name(self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        }
    }

    fn apply(self, z: DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Activation::Relu => z.map(|x| x.max(0.0)),
            Activation::Tanh => z.map(f64::tanh),
            Activation::Sigmoid => z.map(|x| 1.0 / (1.0 + (-x).exp())),
            Activation::Softmax => softmax_rows(z),
        }
    }

    /// Derivative expressed through the activation output `a`.
    fn derivative(self, a: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Activation::Relu => a.map(|x| if x > 0.0 { 1.0 } else { 0.0 }),
            Activation::Tanh => a.map(|x| 1.0 - x * x),
            Activation::Sigmoid => a.map(|x| x * (1.0 - x)),
            Activation::Softmax => a.map(|_| 1.0),
        }
    }
}

fn softmax_rows(mut z: DMatrix<f64>) -> DMatrix<f64> {
    for i in 0..z.nrows() {
        let max = z.row(i).max();
        let mut sum = 0.0;
        for j in 0..z.ncols() {
            let e = (z[(i, j)] - max).exp();
            z[(i, j)] = e;
            sum += e;
        }
        for j in 0..z.ncols() {
            z[(i, j)] /= sum;
        }
    }
    z
}

/// Mean sparse categorical cross-entropy of softmax outputs.
pub fn cross_entropy(probs: &DMatrix<f64>, labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let total: f64 = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| -probs[(i, label)].clamp(EPSILON, 1.0 - EPSILON).ln())
        .sum();
    total / labels.len() as f64
}

/// Index of the largest value in each row.
pub fn argmax_rows(m: &DMatrix<f64>) -> Vec<usize> {
    (0..m.nrows())
        .map(|i| {
            let row = m.row(i);
            row.iter()
                .enumerate()
                .fold(0, |best, (j, &v)| if v > row[best] { j } else { best })
        })
        .collect()
}

fn count_correct(probs: &DMatrix<f64>, labels: &[usize]) -> usize {
    argmax_rows(probs)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    #[serde(serialize_with = "serialize_dmatrix", deserialize_with = "deserialize_dmatrix")]
    pub weights: DMatrix<f64>,
    #[serde(serialize_with = "serialize_dvector", deserialize_with = "deserialize_dvector")]
    pub biases: DVector<f64>,
    pub activation: Activation,
}

impl Dense {
    /// Glorot-uniform weights, zero biases.
    fn new(input_size: usize, output_size: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        let weights = DMatrix::from_fn(input_size, output_size, |_, _| rng.gen_range(-limit..limit));
        Dense {
            weights,
            biases: DVector::zeros(output_size),
            activation,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn n_params(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut z = x * &self.weights;
        for i in 0..z.nrows() {
            for j in 0..z.ncols() {
                z[(i, j)] += self.biases[j];
            }
        }
        self.activation.apply(z)
    }
}

#[derive(Debug, Clone)]
struct LayerGradient {
    weights: DMatrix<f64>,
    biases: DVector<f64>,
}

/// The "compile" settings of a training run.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub optimizer: Optimizer,
    /// Epochs without improvement before stopping; 0 disables early stopping.
    pub patience: usize,
    pub seed: u64,
    pub log_every: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class: usize,
    pub species: String,
    pub probabilities: Vec<f64>,
}

/// Dense softmax classifier. Every public method takes raw measurements and
/// applies the stored scaler first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralNet {
    layers: Vec<Dense>,
    scaler: Scaler,
    class_names: Vec<String>,
}

impl NeuralNet {
    pub fn new(
        input_size: usize,
        hidden_sizes: &[usize],
        hidden_activation: Activation,
        class_names: Vec<String>,
        scaler: Scaler,
        seed: u64,
    ) -> Result<Self> {
        ensure!(input_size > 0, "input size must be positive");
        ensure!(class_names.len() >= 2, "need at least two classes");
        ensure!(
            hidden_activation != Activation::Softmax,
            "softmax is reserved for the output layer"
        );
        ensure!(
            hidden_sizes.iter().all(|&h| h > 0),
            "hidden layer sizes must be positive"
        );

        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(hidden_sizes.len() + 1);
        let mut input_dim = input_size;

        for &hidden_size in hidden_sizes {
            layers.push(Dense::new(input_dim, hidden_size, hidden_activation, &mut rng));
            input_dim = hidden_size;
        }
        layers.push(Dense::new(input_dim, class_names.len(), Activation::Softmax, &mut rng));

        let net = NeuralNet {
            layers,
            scaler,
            class_names,
        };
        net.check_shapes()?;
        Ok(net)
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].input_size()
    }

    pub fn n_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn n_params(&self) -> usize {
        self.layers.iter().map(Dense::n_params).sum()
    }

    fn check_shapes(&self) -> Result<()> {
        ensure!(!self.layers.is_empty(), "model has no layers");
        for (i, pair) in self.layers.windows(2).enumerate() {
            ensure!(
                pair[0].output_size() == pair[1].input_size(),
                "layer {} outputs {} values but layer {} expects {}",
                i + 1,
                pair[0].output_size(),
                i + 2,
                pair[1].input_size()
            );
        }
        for (i, layer) in self.layers.iter().enumerate() {
            ensure!(
                layer.biases.len() == layer.output_size(),
                "layer {} has {} biases for {} units",
                i + 1,
                layer.biases.len(),
                layer.output_size()
            );
        }
        let last = &self.layers[self.layers.len() - 1];
        ensure!(
            last.output_size() == self.class_names.len(),
            "output layer has {} units for {} classes",
            last.output_size(),
            self.class_names.len()
        );
        ensure!(last.activation == Activation::Softmax, "output layer must be softmax");
        if let Some(n) = self.scaler.n_features() {
            ensure!(
                n == self.input_size(),
                "scaler expects {} features, model expects {}",
                n,
                self.input_size()
            );
        }
        Ok(())
    }

    fn check_input(&self, features: &DMatrix<f64>) -> Result<()> {
        ensure!(
            features.ncols() == self.input_size(),
            "expected {} features, got {}",
            self.input_size(),
            features.ncols()
        );
        ensure!(
            features.iter().all(|x| x.is_finite()),
            "measurements must be finite numbers"
        );
        Ok(())
    }

    fn check_labels(&self, labels: &[usize]) -> Result<()> {
        if let Some(&bad) = labels.iter().find(|&&l| l >= self.n_classes()) {
            bail!("label {} is out of range for {} classes", bad, self.n_classes());
        }
        Ok(())
    }

    /// Outputs of every layer; element 0 is the (scaled) input itself.
    fn feedforward(&self, x: &DMatrix<f64>) -> Vec<DMatrix<f64>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.clone());
        for layer in &self.layers {
            let next = layer.forward(&activations[activations.len() - 1]);
            activations.push(next);
        }
        activations
    }

    fn backpropagate(&self, activations: &[DMatrix<f64>], labels: &[usize]) -> Vec<LayerGradient> {
        let n = labels.len() as f64;
        // softmax + cross-entropy: dL/dz = p - y
        let mut delta = activations[activations.len() - 1].clone();
        for (i, &label) in labels.iter().enumerate() {
            delta[(i, label)] -= 1.0;
        }
        delta /= n;

        let mut gradients = Vec::with_capacity(self.layers.len());
        for idx in (0..self.layers.len()).rev() {
            let input = &activations[idx];
            gradients.push(LayerGradient {
                weights: input.transpose() * &delta,
                biases: delta.row_sum().transpose(),
            });
            if idx > 0 {
                let upstream = &delta * self.layers[idx].weights.transpose();
                let prime = self.layers[idx - 1].activation.derivative(input);
                delta = upstream.component_mul(&prime);
            }
        }
        gradients.reverse();
        gradients
    }

    fn apply_gradients(&mut self, optimizer: &mut Optimizer, gradients: &[LayerGradient]) {
        optimizer.begin_step();
        for (i, (layer, grad)) in self.layers.iter_mut().zip(gradients).enumerate() {
            optimizer.update(2 * i, layer.weights.as_mut_slice(), grad.weights.as_slice());
            optimizer.update(2 * i + 1, layer.biases.as_mut_slice(), grad.biases.as_slice());
        }
    }

    /// Mini-batch training. Validation data, when given, is scored after every epoch.
    pub fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        options: &mut FitOptions,
    ) -> Result<History> {
        ensure!(!train.is_empty(), "training set is empty");
        ensure!(options.batch_size > 0, "batch size must be positive");
        self.check_input(&train.features)?;
        self.check_labels(&train.labels)?;

        let x = self.scaler.transform(&train.features);
        let val = match validation {
            Some(v) if !v.is_empty() => {
                self.check_input(&v.features)?;
                self.check_labels(&v.labels)?;
                Some((self.scaler.transform(&v.features), v.labels.as_slice()))
            }
            _ => None,
        };

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut history = History::default();
        let mut best: Option<(f64, Vec<Dense>)> = None;
        let mut stale_epochs = 0;

        tracing::info!(
            "Training {} samples for {} epochs (batch {}, lr {})",
            train.len(),
            options.epochs,
            options.batch_size,
            options.optimizer.learning_rate()
        );

        for epoch in 1..=options.epochs {
            indices.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            let mut correct = 0;

            for batch in indices.chunks(options.batch_size) {
                let bx = DMatrix::from_fn(batch.len(), x.ncols(), |r, c| x[(batch[r], c)]);
                let by: Vec<usize> = batch.iter().map(|&i| train.labels[i]).collect();

                let activations = self.feedforward(&bx);
                let probs = &activations[activations.len() - 1];
                loss_sum += cross_entropy(probs, &by) * batch.len() as f64;
                correct += count_correct(probs, &by);

                let gradients = self.backpropagate(&activations, &by);
                self.apply_gradients(&mut options.optimizer, &gradients);
            }

            let (val_loss, val_accuracy) = match &val {
                Some((vx, vy)) => {
                    let probs = self.forward_scaled(vx);
                    (
                        Some(cross_entropy(&probs, vy)),
                        Some(count_correct(&probs, vy) as f64 / vy.len() as f64),
                    )
                }
                None => (None, None),
            };
            let metrics = EpochMetrics {
                epoch,
                loss: loss_sum / train.len() as f64,
                accuracy: correct as f64 / train.len() as f64,
                val_loss,
                val_accuracy,
            };

            let log_every = options.log_every.max(1);
            if epoch == 1 || epoch % log_every == 0 || epoch == options.epochs {
                tracing::info!(
                    "Epoch {}/{}: loss={:.4} accuracy={:.4} val_loss={} val_accuracy={}",
                    epoch,
                    options.epochs,
                    metrics.loss,
                    metrics.accuracy,
                    metrics.val_loss.map_or("-".into(), |v| format!("{:.4}", v)),
                    metrics.val_accuracy.map_or("-".into(), |v| format!("{:.4}", v)),
                );
            } else {
                tracing::debug!("Epoch {}: loss={:.6}", epoch, metrics.loss);
            }

            let monitored = metrics.val_loss.unwrap_or(metrics.loss);
            history.push(metrics);

            if options.patience > 0 {
                let improved = best.as_ref().map_or(true, |(b, _)| monitored < *b);
                if improved {
                    best = Some((monitored, self.layers.clone()));
                    stale_epochs = 0;
                } else {
                    stale_epochs += 1;
                    if stale_epochs >= options.patience {
                        tracing::info!("Early stopping at epoch {}", epoch);
                        history.stopped_early_at = Some(epoch);
                        break;
                    }
                }
            }
        }

        if let Some((loss, layers)) = best {
            tracing::debug!("Restoring best weights (monitored loss {:.4})", loss);
            self.layers = layers;
        }

        Ok(history)
    }

    fn forward_scaled(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut activations = self.feedforward(x);
        activations.pop().unwrap_or_else(|| x.clone())
    }

    /// Class probabilities, one row per sample.
    pub fn predict_proba(&self, features: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.check_input(features)?;
        Ok(self.forward_scaled(&self.scaler.transform(features)))
    }

    pub fn predict(&self, features: &DMatrix<f64>) -> Result<Vec<usize>> {
        Ok(argmax_rows(&self.predict_proba(features)?))
    }

    pub fn predict_one(&self, sample: &[f64]) -> Result<Prediction> {
        let x = DMatrix::from_row_slice(1, sample.len(), sample);
        let probs = self.predict_proba(&x)?;
        let class = argmax_rows(&probs)[0];
        Ok(Prediction {
            class,
            species: self.class_names[class].clone(),
            probabilities: probs.row(0).iter().copied().collect(),
        })
    }

    /// Mean cross-entropy and accuracy on a labelled dataset.
    pub fn score(&self, data: &Dataset) -> Result<(f64, f64)> {
        self.check_labels(&data.labels)?;
        let probs = self.predict_proba(&data.features)?;
        let accuracy = count_correct(&probs, &data.labels) as f64 / data.len().max(1) as f64;
        Ok((cross_entropy(&probs, &data.labels), accuracy))
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let rule = "-".repeat(56);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "{:<12}{:<16}{:<12}{:>16}", "Layer", "Output shape", "Activation", "Params");
        let _ = writeln!(out, "{}", rule);
        for (i, layer) in self.layers.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:<12}{:<16}{:<12}{:>16}",
                format!("dense_{}", i + 1),
                format!("(None, {})", layer.output_size()),
                layer.activation.name(),
                layer.n_params()
            );
        }
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Total params: {}", self.n_params());
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        tracing::debug!("Saved model to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let reader = BufReader::new(file);
        let nn: NeuralNet = serde_json::from_reader(reader)
            .with_context(|| format!("{} is not a valid model file", path.display()))?;
        nn.check_shapes()
            .with_context(|| format!("inconsistent model in {}", path.display()))?;
        Ok(nn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::{load_iris, train_test_split, Scaling, Species};
    use crate::optimizer::OptimizerKind;

    fn tiny_net(activation: Activation) -> NeuralNet {
        NeuralNet::new(
            3,
            &[4],
            activation,
            vec!["a".into(), "b".into(), "c".into()],
            Scaler::Identity,
            5,
        )
        .unwrap()
    }

    fn options(epochs: usize) -> FitOptions {
        FitOptions {
            epochs,
            batch_size: 16,
            optimizer: Optimizer::new(OptimizerKind::Adam, 0.01),
            patience: 0,
            seed: 42,
            log_every: 10,
        }
    }

    #[test]
    fn probabilities_sum_to_one_per_row() {
        let net = tiny_net(Activation::Relu);
        let x = DMatrix::from_row_slice(2, 3, &[0.5, -1.0, 2.0, 10.0, 20.0, -30.0]);
        let probs = net.predict_proba(&x).unwrap();
        assert_eq!(probs.shape(), (2, 3));
        for row in probs.row_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn biases_are_added_to_every_row() {
        let mut net = tiny_net(Activation::Relu);
        for w in net.layers[0].weights.iter_mut() {
            *w = 0.0;
        }
        net.layers[0].biases = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let x = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let hidden = &net.feedforward(&x)[1];
        for i in 0..3 {
            assert_eq!(hidden.row(i).iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
        }
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let net = tiny_net(Activation::Tanh);
        let x = DMatrix::from_row_slice(3, 3, &[0.2, -0.4, 0.9, 1.1, 0.3, -0.7, -0.5, 0.8, 0.1]);
        let labels = [0, 2, 1];
        let grads = net.backpropagate(&net.feedforward(&x), &labels);

        let loss_of = |n: &NeuralNet| cross_entropy(&n.forward_scaled(&x), &labels);
        let h = 1e-6;
        for (layer, i, j) in [(0, 0, 0), (0, 2, 3), (1, 1, 2), (1, 3, 0)] {
            let mut plus = net.clone();
            plus.layers[layer].weights[(i, j)] += h;
            let mut minus = net.clone();
            minus.layers[layer].weights[(i, j)] -= h;
            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert!((numeric - grads[layer].weights[(i, j)]).abs() < 1e-6);
        }
        for (layer, j) in [(0, 1), (1, 2)] {
            let mut plus = net.clone();
            plus.layers[layer].biases[j] += h;
            let mut minus = net.clone();
            minus.layers[layer].biases[j] -= h;
            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
            assert!((numeric - grads[layer].biases[j]).abs() < 1e-6);
        }
    }

    #[test]
    fn learns_iris() {
        let data = load_iris(None).unwrap();
        let (train, test) = train_test_split(&data, 0.2, 42, true).unwrap();
        let scaler = Scaler::fit(Scaling::MinMax, &train.features);
        let mut net =
            NeuralNet::new(4, &[10, 10], Activation::Relu, Species::class_names(), scaler, 42).unwrap();

        let history = net.fit(&train, Some(&test), &mut options(100)).unwrap();
        assert_eq!(history.len(), 100);
        let first = &history.epochs[0];
        let last = history.last().unwrap();
        assert!(last.loss < first.loss);
        assert!(last.accuracy > 0.9, "train accuracy {}", last.accuracy);

        let (_, test_accuracy) = net.score(&test).unwrap();
        assert!(test_accuracy > 0.85, "test accuracy {}", test_accuracy);
    }

    #[test]
    fn early_stopping_halts_and_restores_best_weights() {
        let data = load_iris(None).unwrap();
        let (train, _) = train_test_split(&data, 0.2, 1, true).unwrap();
        // same measurements, wrong species: validation loss rises as training succeeds
        let shifted: Vec<usize> = train.labels.iter().map(|l| (l + 1) % 3).collect();
        let contradicting = Dataset::new(train.features.clone(), shifted).unwrap();

        let mut net = NeuralNet::new(
            4,
            &[8],
            Activation::Relu,
            Species::class_names(),
            Scaler::fit(Scaling::Standard, &train.features),
            3,
        )
        .unwrap();
        let mut opts = options(500);
        opts.optimizer = Optimizer::new(OptimizerKind::Adam, 0.05);
        opts.patience = 5;

        let history = net.fit(&train, Some(&contradicting), &mut opts).unwrap();
        let stopped = history.stopped_early_at.expect("should stop before 500 epochs");
        assert_eq!(stopped, history.len());
        assert!(stopped < 500);

        let best = history.best_epoch().unwrap().val_loss.unwrap();
        let (restored, _) = net.score(&contradicting).unwrap();
        assert!((restored - best).abs() < 1e-9);
    }

    #[test]
    fn fit_rejects_mismatched_data() {
        let mut net = tiny_net(Activation::Relu);
        let wrong_width = Dataset::new(DMatrix::zeros(2, 4), vec![0, 1]).unwrap();
        assert!(net.fit(&wrong_width, None, &mut options(1)).is_err());
        let bad_label = Dataset::new(DMatrix::zeros(2, 3), vec![0, 3]).unwrap();
        assert!(net.fit(&bad_label, None, &mut options(1)).is_err());
        assert!(net.predict_one(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn non_finite_measurements_are_rejected_instead_of_classified() {
        let mut net = tiny_net(Activation::Relu);
        assert!(net.predict_one(&[f64::NAN, 1.0, 2.0]).is_err());
        assert!(net.predict_one(&[1.0, f64::INFINITY, 2.0]).is_err());
        assert!(net.predict_one(&[1.0, 0.5, 2.0]).is_ok());

        let mut train = Dataset::new(DMatrix::from_element(2, 3, 1.0), vec![0, 1]).unwrap();
        train.features[(1, 1)] = f64::NAN;
        assert!(net.fit(&train, None, &mut options(1)).is_err());
    }

    #[test]
    fn summary_counts_parameters() {
        let net = NeuralNet::new(4, &[10, 10], Activation::Relu, Species::class_names(), Scaler::Identity, 0)
            .unwrap();
        assert_eq!(net.n_params(), 50 + 110 + 33);
        let summary = net.summary();
        assert!(summary.contains("dense_3"));
        assert!(summary.contains("softmax"));
        assert!(summary.contains("Total params: 193"));
    }

    #[test]
    fn saved_model_reloads_with_identical_predictions() {
        let data = load_iris(None).unwrap();
        let scaler = Scaler::fit(Scaling::MinMax, &data.features);
        let mut net = NeuralNet::new(4, &[6, 5], Activation::Relu, Species::class_names(), scaler, 9).unwrap();
        net.fit(&data, None, &mut options(5)).unwrap();

        let dir = std::env::temp_dir().join(format!("iris_mlp_model_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        net.save(&path).unwrap();
        let loaded = NeuralNet::load(&path).unwrap();

        assert_eq!(loaded.layers()[0].weights, net.layers()[0].weights);
        assert_eq!(loaded.scaler(), net.scaler());
        let a = net.predict_proba(&data.features).unwrap();
        let b = loaded.predict_proba(&data.features).unwrap();
        assert!((a - b).abs().max() < 1e-12);

        let sample = [6.3, 3.3, 6.0, 2.5];
        assert_eq!(net.predict_one(&sample).unwrap().class, loaded.predict_one(&sample).unwrap().class);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_rejects_inconsistent_shapes() {
        let net = tiny_net(Activation::Sigmoid);
        let mut json: serde_json::Value = serde_json::to_value(&net).unwrap();
        json["class_names"] = serde_json::json!(["a", "b"]);

        let dir = std::env::temp_dir().join(format!("iris_mlp_bad_model_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        std::fs::write(&path, json.to_string()).unwrap();
        assert!(NeuralNet::load(&path).is_err());

        json["class_names"] = serde_json::json!(["a", "b", "c"]);
        json["layers"][0]["weights"]["nrows"] = serde_json::json!(2);
        std::fs::write(&path, json.to_string()).unwrap();
        assert!(NeuralNet::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
