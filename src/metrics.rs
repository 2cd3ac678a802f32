//! Evaluation of a trained classifier: confusion matrix and per-class scores.

use crate::data_loader::Dataset;
use crate::neural_net::NeuralNet;
use anyhow::{bail, Result};
use std::fmt;

/// Rows are actual classes, columns are predicted classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
    class_names: Vec<String>,
}

impl ConfusionMatrix {
    pub fn from_predictions(actual: &[usize], predicted: &[usize], class_names: &[String]) -> Result<Self> {
        if actual.len() != predicted.len() {
            bail!(
                "{} actual labels but {} predictions",
                actual.len(),
                predicted.len()
            );
        }
        let n = class_names.len();
        let mut counts = vec![vec![0; n]; n];
        for (&a, &p) in actual.iter().zip(predicted) {
            if a >= n || p >= n {
                bail!("label pair ({}, {}) is out of range for {} classes", a, p, n);
            }
            counts[a][p] += 1;
        }
        Ok(ConfusionMatrix {
            counts,
            class_names: class_names.to_vec(),
        })
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let correct: usize = (0..self.counts.len()).map(|i| self.counts[i][i]).sum();
        ratio(correct, self.total())
    }

    pub fn precision(&self, class: usize) -> f64 {
        let predicted: usize = self.counts.iter().map(|row| row[class]).sum();
        ratio(self.counts[class][class], predicted)
    }

    pub fn recall(&self, class: usize) -> f64 {
        let actual: usize = self.counts[class].iter().sum();
        ratio(self.counts[class][class], actual)
    }

    pub fn f1(&self, class: usize) -> f64 {
        let (p, r) = (self.precision(class), self.recall(class));
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Precision, recall and F1 per class.
    pub fn report(&self) -> String {
        let width = self.name_width();
        let mut out = format!(
            "{:<width$}  {:>9}  {:>9}  {:>9}  {:>7}\n",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        );
        for (i, name) in self.class_names.iter().enumerate() {
            out.push_str(&format!(
                "{:<width$}  {:>9.3}  {:>9.3}  {:>9.3}  {:>7}\n",
                name,
                self.precision(i),
                self.recall(i),
                self.f1(i),
                self.support(i),
                width = width
            ));
        }
        out.push_str(&format!(
            "{:<width$}  {:>9}  {:>9}  {:>9.3}  {:>7}\n",
            "accuracy",
            "",
            "",
            self.accuracy(),
            self.total(),
            width = width
        ));
        out
    }

    fn name_width(&self) -> usize {
        self.class_names
            .iter()
            .map(|n| n.len())
            .chain(std::iter::once("accuracy".len()))
            .max()
            .unwrap_or(8)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.name_width();
        let cell = self.class_names.iter().map(|n| n.len()).max().unwrap_or(4).max(4);
        write!(f, "{:<width$}", "actual \\ pred", width = width.max(13))?;
        for name in &self.class_names {
            write!(f, "  {:>cell$}", name, cell = cell)?;
        }
        writeln!(f)?;
        for (name, row) in self.class_names.iter().zip(self.counts()) {
            write!(f, "{:<width$}", name, width = width.max(13))?;
            for count in row {
                write!(f, "  {:>cell$}", count, cell = cell)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
}

pub fn evaluate(model: &NeuralNet, data: &Dataset) -> Result<Evaluation> {
    if data.is_empty() {
        bail!("cannot evaluate on an empty dataset");
    }
    let (loss, accuracy) = model.score(data)?;
    let predicted = model.predict(&data.features)?;
    let confusion = ConfusionMatrix::from_predictions(&data.labels, &predicted, model.class_names())?;
    tracing::info!(
        "Evaluated {} samples: loss={:.4} accuracy={:.4}",
        data.len(),
        loss,
        accuracy
    );
    Ok(Evaluation {
        loss,
        accuracy,
        confusion,
    })
}
