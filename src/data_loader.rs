use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use csv::ReaderBuilder;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Fisher's iris measurements, shipped inside the binary.
const BUILTIN_IRIS: &str = include_str!("../data/iris.csv");

pub const FEATURE_NAMES: [&str; 4] = ["sepal_length", "sepal_width", "petal_length", "petal_width"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Species {
    Setosa,
    Versicolor,
    Virginica,
}

impl Species {
    pub const ALL: [Species; 3] = [Species::Setosa, Species::Versicolor, Species::Virginica];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Species::Setosa => "setosa",
            Species::Versicolor => "versicolor",
            Species::Virginica => "virginica",
        }
    }

    pub fn class_names() -> Vec<String> {
        Self::ALL.iter().map(|s| s.name().to_string()).collect()
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Species {
    type Err = anyhow::Error;

    /// Accepts `setosa` as well as the UCI spelling `Iris-setosa`.
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().trim_matches('"').to_lowercase();
        let name = lowered.trim_start_matches("iris-");
        Self::ALL
            .iter()
            .copied()
            .find(|species| species.name() == name)
            .ok_or_else(|| anyhow!("unknown species '{}'", s))
    }
}

/// Measurements as an `n x 4` matrix and sparse class labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: DMatrix<f64>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn new(features: DMatrix<f64>, labels: Vec<usize>) -> Result<Self> {
        if features.nrows() != labels.len() {
            bail!(
                "feature rows ({}) and labels ({}) differ in length",
                features.nrows(),
                labels.len()
            );
        }
        Ok(Dataset { features, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn subset(&self, indices: &[usize]) -> Dataset {
        let features = DMatrix::from_fn(indices.len(), self.features.ncols(), |r, c| {
            self.features[(indices[r], c)]
        });
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Dataset { features, labels }
    }

    pub fn class_counts(&self, n_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; n_classes];
        for &label in &self.labels {
            if label < n_classes {
                counts[label] += 1;
            }
        }
        counts
    }
}

/// Loads the iris table from `path`, or the embedded copy when no path is given.
pub fn load_iris(path: Option<&Path>) -> Result<Dataset> {
    let contents = match path {
        Some(path) => {
            let mut buf = String::new();
            File::open(path)
                .and_then(|mut f| f.read_to_string(&mut buf))
                .with_context(|| format!("failed to read {}", path.display()))?;
            buf
        }
        None => BUILTIN_IRIS.to_string(),
    };
    parse_iris(&contents)
}

pub fn parse_iris(contents: &str) -> Result<Dataset> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(contents.as_bytes());
    let mut inputs = Vec::new();
    let mut labels = Vec::new();

    for (row, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("malformed csv at data row {}", row + 1))?;

        if record.len() != FEATURE_NAMES.len() + 1 {
            tracing::warn!("Skipping malformed row {}: {:?}", row + 1, record);
            continue;
        }

        for field in record.iter().take(FEATURE_NAMES.len()) {
            let value: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("row {}: '{}' is not a number", row + 1, field))?;
            if !value.is_finite() {
                bail!("row {}: measurement '{}' is not finite", row + 1, field);
            }
            inputs.push(value);
        }
        let species: Species = record[FEATURE_NAMES.len()]
            .parse()
            .with_context(|| format!("row {}", row + 1))?;
        labels.push(species.index());
    }

    if labels.is_empty() {
        bail!("no iris rows found");
    }

    let features = DMatrix::from_row_slice(labels.len(), FEATURE_NAMES.len(), &inputs);
    tracing::debug!("Loaded {} iris samples", labels.len());
    Dataset::new(features, labels)
}

/// Shuffles with a seeded RNG and splits into `(train, test)`.
///
/// With `stratify` every class is split on its own, so both sides keep the
/// class proportions of the full dataset.
pub fn train_test_split(
    dataset: &Dataset,
    test_fraction: f64,
    seed: u64,
    stratify: bool,
) -> Result<(Dataset, Dataset)> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        bail!("test fraction must lie in (0, 1), got {}", test_fraction);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let groups: Vec<Vec<usize>> = if stratify {
        let n_classes = dataset.labels.iter().max().map_or(0, |&m| m + 1);
        let mut groups = vec![Vec::new(); n_classes];
        for (i, &label) in dataset.labels.iter().enumerate() {
            groups[label].push(i);
        }
        groups
    } else {
        vec![(0..dataset.len()).collect()]
    };

    let mut train_indices = Vec::with_capacity(dataset.len());
    let mut test_indices = Vec::new();
    for mut group in groups {
        group.shuffle(&mut rng);
        let n_test = ((group.len() as f64 * test_fraction).round() as usize).min(group.len());
        let (test, train) = group.split_at(n_test);
        test_indices.extend_from_slice(test);
        train_indices.extend_from_slice(train);
    }
    // groups were appended class by class
    train_indices.shuffle(&mut rng);
    test_indices.shuffle(&mut rng);

    tracing::debug!(
        "Dataset split: {} training, {} test",
        train_indices.len(),
        test_indices.len()
    );

    Ok((dataset.subset(&train_indices), dataset.subset(&test_indices)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scaling {
    None,
    MinMax,
    Standard,
}

/// Per-column input transform, fitted on training data and saved with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Scaler {
    Identity,
    MinMax { mins: Vec<f64>, maxs: Vec<f64> },
    Standard { means: Vec<f64>, stds: Vec<f64> },
}

impl Scaler {
    pub fn fit(scaling: Scaling, features: &DMatrix<f64>) -> Scaler {
        match scaling {
            Scaling::None => Scaler::Identity,
            Scaling::MinMax => Scaler::MinMax {
                mins: features.column_iter().map(|col| col.min()).collect(),
                maxs: features.column_iter().map(|col| col.max()).collect(),
            },
            Scaling::Standard => {
                let means: Vec<f64> = features.column_iter().map(|col| col.mean()).collect();
                let stds = features
                    .column_iter()
                    .zip(&means)
                    .map(|(col, mean)| {
                        let var = col.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                            / col.len().max(1) as f64;
                        var.sqrt()
                    })
                    .collect();
                Scaler::Standard { means, stds }
            }
        }
    }

    pub fn n_features(&self) -> Option<usize> {
        match self {
            Scaler::Identity => None,
            Scaler::MinMax { mins, .. } => Some(mins.len()),
            Scaler::Standard { means, .. } => Some(means.len()),
        }
    }

    pub fn transform(&self, features: &DMatrix<f64>) -> DMatrix<f64> {
        let (offsets, scales) = match self {
            Scaler::Identity => return features.clone(),
            Scaler::MinMax { mins, maxs } => {
                let ranges: Vec<f64> = mins.iter().zip(maxs).map(|(lo, hi)| hi - lo).collect();
                (mins, ranges)
            }
            Scaler::Standard { means, stds } => (means, stds.clone()),
        };
        DMatrix::from_fn(features.nrows(), features.ncols(), |i, j| {
            let scale = if scales[j].abs() < f64::EPSILON { 1.0 } else { scales[j] };
            (features[(i, j)] - offsets[j]) / scale
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_dataset_has_fifty_of_each_species() {
        let data = load_iris(None).unwrap();
        assert_eq!(data.len(), 150);
        assert_eq!(data.n_features(), 4);
        assert_eq!(data.class_counts(3), vec![50, 50, 50]);
        assert_eq!(data.features[(0, 0)], 5.1);
        assert_eq!(data.labels[149], Species::Virginica.index());
    }

    #[test]
    fn species_parsing_accepts_uci_names() {
        assert_eq!("Iris-versicolor".parse::<Species>().unwrap(), Species::Versicolor);
        assert_eq!("\"SETOSA\"".parse::<Species>().unwrap(), Species::Setosa);
        assert!("rose".parse::<Species>().is_err());
    }

    #[test]
    fn short_rows_are_skipped_and_bad_values_fail() {
        let data = parse_iris("a,b,c,d,e\n1,2,3,4,setosa\n1,2,3\n5,6,7,8,virginica\n").unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.labels, vec![0, 2]);

        assert!(parse_iris("a,b,c,d,e\n1,x,3,4,setosa\n").is_err());
        assert!(parse_iris("a,b,c,d,e\n1,2,3,4,tulip\n").is_err());
        assert!(parse_iris("a,b,c,d,e\n").is_err());
    }

    #[test]
    fn long_rows_are_skipped_too() {
        let data = parse_iris("a,b,c,d,e\n1,2,3,4,setosa,extra\n5,6,7,8,versicolor\n").unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.labels, vec![1]);
    }

    #[test]
    fn non_finite_measurements_are_rejected() {
        assert!(parse_iris("a,b,c,d,e\n1,NaN,3,4,setosa\n").is_err());
        assert!(parse_iris("a,b,c,d,e\n1,2,inf,4,setosa\n").is_err());
    }

    #[test]
    fn loads_a_csv_file_from_disk() {
        let dir = std::env::temp_dir().join(format!("iris_mlp_loader_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flowers.csv");
        std::fs::write(
            &path,
            "sepal_length,sepal_width,petal_length,petal_width,species\n\
             5.0,3.4,1.5,0.2,Iris-setosa\n\
             6.4,3.2,4.5,1.5,Iris-versicolor\n\
             6.3,3.3,6.0,2.5,Iris-virginica\n",
        )
        .unwrap();

        let data = load_iris(Some(&path)).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.labels, vec![0, 1, 2]);
        assert_eq!(data.features[(1, 2)], 4.5);

        let missing = dir.join("missing.csv");
        let err = load_iris(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stratified_split_keeps_class_balance() {
        let data = load_iris(None).unwrap();
        let (train, test) = train_test_split(&data, 0.2, 42, true).unwrap();
        assert_eq!(train.len(), 120);
        assert_eq!(test.len(), 30);
        assert_eq!(test.class_counts(3), vec![10, 10, 10]);
        assert_eq!(train.class_counts(3), vec![40, 40, 40]);
    }

    #[test]
    fn split_is_reproducible_and_loses_nothing() {
        let data = load_iris(None).unwrap();
        let (a_train, a_test) = train_test_split(&data, 0.3, 7, false).unwrap();
        let (b_train, b_test) = train_test_split(&data, 0.3, 7, false).unwrap();
        assert_eq!(a_train.labels, b_train.labels);
        assert_eq!(a_test.features, b_test.features);
        assert_eq!(a_train.len() + a_test.len(), 150);
        assert_eq!(a_test.len(), 45);

        let total: f64 = data.features.sum();
        let split_total = a_train.features.sum() + a_test.features.sum();
        assert!((total - split_total).abs() < 1e-9);
    }

    #[test]
    fn split_rejects_degenerate_fractions() {
        let data = load_iris(None).unwrap();
        assert!(train_test_split(&data, 0.0, 1, true).is_err());
        assert!(train_test_split(&data, 1.0, 1, true).is_err());
    }

    #[test]
    fn min_max_scaler_maps_training_columns_to_unit_range() {
        let data = load_iris(None).unwrap();
        let scaler = Scaler::fit(Scaling::MinMax, &data.features);
        let scaled = scaler.transform(&data.features);
        for col in scaled.column_iter() {
            assert!(col.min().abs() < 1e-12);
            assert!((col.max() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn standard_scaler_centres_columns_and_tolerates_constant_ones() {
        let features = DMatrix::from_row_slice(3, 2, &[1.0, 4.0, 2.0, 4.0, 3.0, 4.0]);
        let scaler = Scaler::fit(Scaling::Standard, &features);
        let scaled = scaler.transform(&features);
        assert!(scaled.column(0).mean().abs() < 1e-12);
        assert!(scaled.column(1).iter().all(|&x| x == 0.0));
        assert_eq!(Scaler::fit(Scaling::None, &features).transform(&features), features);
    }
}
