//! The sample container shared by the planner and the shard writer, and the thin adapters that
//! load it from files.
//!
//! A [`Dataset`] is an ordered sequence of fixed-shape feature records with a parallel label
//! sequence. Features are stored row-major in one flat buffer, so sample `i` occupies
//! `features[i * feature_dim..(i + 1) * feature_dim]`.

use std::{collections::BTreeSet, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or loading a [`Dataset`].
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("feature buffer holds {features} values, expected {samples} samples x {dim}")]
    Shape {
        features: usize,
        samples: usize,
        dim: usize,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Csv {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("unsupported dataset format: {0}")]
    UnsupportedFormat(String),
    #[error("cannot take {requested} evaluation samples from a dataset of {available}")]
    EvalSplit { requested: usize, available: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An immutable set of labelled samples.
pub struct Dataset {
    feature_dim: usize,
    features: Vec<f32>,
    labels: Vec<u32>,
}

impl Dataset {
    /// Creates a dataset from a row-major feature buffer and the matching labels.
    ///
    /// # Errors
    /// Fails if the buffer length is not `labels.len() * feature_dim`.
    pub fn new(
        feature_dim: usize,
        features: Vec<f32>,
        labels: Vec<u32>,
    ) -> Result<Self, DatasetError> {
        if labels.len().checked_mul(feature_dim) != Some(features.len()) {
            return Err(DatasetError::Shape {
                features: features.len(),
                samples: labels.len(),
                dim: feature_dim,
            });
        }
        Ok(Self {
            feature_dim,
            features,
            labels,
        })
    }

    /// Creates a dataset from one feature vector per sample.
    pub fn from_rows(rows: Vec<Vec<f32>>, labels: Vec<u32>) -> Result<Self, DatasetError> {
        let feature_dim = rows.first().map(Vec::len).unwrap_or(0);
        if rows.len() != labels.len() || rows.iter().any(|row| row.len() != feature_dim) {
            return Err(DatasetError::Shape {
                features: rows.iter().map(Vec::len).sum(),
                samples: labels.len(),
                dim: feature_dim,
            });
        }
        let features = rows.into_iter().flatten().collect();
        Self::new(feature_dim, features, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Returns the features and label of sample `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn sample(&self, index: usize) -> (&[f32], u32) {
        let start = index * self.feature_dim;
        (
            &self.features[start..start + self.feature_dim],
            self.labels[index],
        )
    }

    /// The distinct labels of the dataset in ascending order.
    pub fn label_set(&self) -> Vec<u32> {
        self.labels
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Gathers the given samples, in the given order, into a new dataset.
    ///
    /// # Panics
    /// Panics if an index is out of bounds. Plans produced by the planner never are.
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        let mut features = Vec::with_capacity(indices.len() * self.feature_dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let (row, label) = self.sample(index);
            features.extend_from_slice(row);
            labels.push(label);
        }
        Dataset {
            feature_dim: self.feature_dim,
            features,
            labels,
        }
    }

    /// Splits off the first `head` samples, returning `(head, tail)`.
    pub fn split_at(self, head: usize) -> Result<(Dataset, Dataset), DatasetError> {
        if head > self.len() {
            return Err(DatasetError::EvalSplit {
                requested: head,
                available: self.len(),
            });
        }
        let Dataset {
            feature_dim,
            mut features,
            mut labels,
        } = self;
        let tail_features = features.split_off(head * feature_dim);
        let tail_labels = labels.split_off(head);
        Ok((
            Dataset {
                feature_dim,
                features,
                labels,
            },
            Dataset {
                feature_dim,
                features: tail_features,
                labels: tail_labels,
            },
        ))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonDataset {
    Flat {
        feature_dim: usize,
        features: Vec<f32>,
        labels: Vec<u32>,
    },
    Rows {
        features: Vec<Vec<f32>>,
        labels: Vec<u32>,
    },
}

/// Loads a dataset, picking the adapter from the file extension (`json` or `csv`).
pub fn load(path: impl AsRef<Path>) -> Result<Dataset, DatasetError> {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => load_json(path),
        Some("csv") => load_csv(path),
        _ => Err(DatasetError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Loads the training and evaluation sets.
///
/// The evaluation set comes from `eval_path` when given, otherwise it is made of the first
/// `eval_size` samples of the training file, which are then removed from the training set.
pub fn load_train_eval(
    train_path: &Path,
    eval_path: Option<&Path>,
    eval_size: Option<usize>,
) -> Result<(Dataset, Dataset), DatasetError> {
    let train = load(train_path)?;
    match (eval_path, eval_size) {
        (Some(eval_path), _) => Ok((train, load(eval_path)?)),
        (None, Some(eval_size)) => {
            let (eval, train) = train.split_at(eval_size)?;
            Ok((train, eval))
        }
        (None, None) => Err(DatasetError::EvalSplit {
            requested: 0,
            available: train.len(),
        }),
    }
}

fn read(path: &Path) -> Result<String, DatasetError> {
    fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn load_json(path: &Path) -> Result<Dataset, DatasetError> {
    let raw = read(path)?;
    let parsed: JsonDataset = serde_json::from_str(&raw).map_err(|source| DatasetError::Json {
        path: path.display().to_string(),
        source,
    })?;
    match parsed {
        JsonDataset::Flat {
            feature_dim,
            features,
            labels,
        } => Dataset::new(feature_dim, features, labels),
        JsonDataset::Rows { features, labels } => Dataset::from_rows(features, labels),
    }
}

fn load_csv(path: &Path) -> Result<Dataset, DatasetError> {
    parse_csv(&read(path)?, &path.display().to_string())
}

/// Parses label-first CSV rows, the layout of the HIGGS dump.
pub(crate) fn parse_csv(raw: &str, origin: &str) -> Result<Dataset, DatasetError> {
    let csv_error = |line: usize, reason: String| DatasetError::Csv {
        path: origin.to_string(),
        line,
        reason,
    };

    let mut feature_dim = None;
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for (number, line) in raw.lines().enumerate().map(|(i, l)| (i + 1, l.trim())) {
        if line.is_empty() {
            continue;
        }
        let mut columns = line.split(',').map(str::trim);
        let label = columns
            .next()
            .ok_or_else(|| csv_error(number, "missing label".into()))?;
        let label = parse_label(label).map_err(|reason| csv_error(number, reason))?;

        let before = features.len();
        for column in columns {
            let value = column
                .parse::<f32>()
                .map_err(|e| csv_error(number, format!("bad feature {:?}: {}", column, e)))?;
            features.push(value);
        }
        let width = features.len() - before;
        match feature_dim {
            None => feature_dim = Some(width),
            Some(dim) if dim != width => {
                return Err(csv_error(
                    number,
                    format!("expected {} features, found {}", dim, width),
                ))
            }
            Some(_) => {}
        }
        labels.push(label);
    }
    Dataset::new(feature_dim.unwrap_or(0), features, labels)
}

fn parse_label(raw: &str) -> Result<u32, String> {
    if let Ok(label) = raw.parse::<u32>() {
        return Ok(label);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|e| format!("bad label {:?}: {}", raw, e))?;
    if value.fract() != 0.0 || value < 0.0 || value > f64::from(u32::MAX) {
        return Err(format!("label {:?} is not a non-negative integer", raw));
    }
    Ok(value as u32)
}
