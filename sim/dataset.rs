//! Tab-separated dataset files.
//!
//! `write_dataset` emits one row per simulated individual with the columns
//! of `SimulatedIndividual`. `load_fit_data` reads any table with at least
//! `sex`, `age` and `outcome` columns (plus an optional `cluster` column)
//! back into a `FitData`. Extra columns are ignored, so a written dataset
//! loads unchanged.

use crate::fit::data::{ClusterIndex, FitData};
use crate::fit::estimate::FitError;
use crate::types::{Sex, SimulatedDataset};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array1;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },

    #[error("The table cannot be fitted: {0}")]
    Table(#[from] FitError),
}

#[derive(Debug, Deserialize)]
struct FitRow {
    sex: Sex,
    age: f64,
    outcome: f64,
    #[serde(default)]
    cluster: Option<String>,
}

/// Writes `dataset` as a tab-separated table with a header row.
pub fn write_dataset(dataset: &SimulatedDataset, path: impl AsRef<Path>) -> Result<(), DatasetError> {
    let path = path.as_ref();
    let file = std::fs::File::create(path).map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(file);
    for individual in &dataset.individuals {
        writer.serialize(individual)?;
    }
    writer.flush().map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    log::info!(
        "Wrote {} individuals to '{}'.",
        dataset.individuals.len(),
        path.display()
    );
    Ok(())
}

/// Reads a tab-separated table into a fitting input. The cluster column is
/// kept only when every row has a label; a partially filled column is an
/// error.
pub fn load_fit_data(path: impl AsRef<Path>) -> Result<FitData, DatasetError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut y = Vec::new();
    let mut male = Vec::new();
    let mut age = Vec::new();
    let mut labels: Vec<Option<String>> = Vec::new();
    for (i, record) in reader.deserialize::<FitRow>().enumerate() {
        let row = record?;
        if !row.age.is_finite() || !row.outcome.is_finite() {
            return Err(DatasetError::InvalidRow {
                row: i + 1,
                reason: "age and outcome must be finite".to_string(),
            });
        }
        y.push(row.outcome);
        male.push(row.sex.indicator());
        age.push(row.age);
        labels.push(row.cluster.filter(|label| !label.is_empty()));
    }

    let labelled = labels.iter().filter(|l| l.is_some()).count();
    let clusters = if labelled == 0 {
        None
    } else if labelled == labels.len() {
        let labels: Vec<String> = labels.into_iter().flatten().collect();
        Some(ClusterIndex::from_labels(&labels))
    } else {
        let row = labels.iter().position(|l| l.is_none()).map_or(0, |p| p + 1);
        return Err(DatasetError::InvalidRow {
            row,
            reason: "cluster label missing while other rows carry one".to_string(),
        });
    };

    let data = FitData::new(
        Array1::from(y),
        Array1::from(male),
        Array1::from(age),
        clusters,
    )?;
    log::info!(
        "Loaded {} rows from '{}'{}.",
        data.n(),
        path.display(),
        data.clusters
            .as_ref()
            .map(|c| format!(" in {} clusters", c.num_clusters()))
            .unwrap_or_default()
    );
    Ok(data)
}
