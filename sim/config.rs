//! TOML study files: one `[simulation]` table and an optional
//! `[monte_carlo]` table.

use crate::montecarlo::MonteCarloConfig;
use crate::types::SimulationConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Everything needed to simulate and replicate a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub monte_carlo: MonteCarloConfig,
}

impl StudyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: StudyConfig = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        log::info!(
            "Loaded study configuration from '{}' (n = {}, {:?} outcome).",
            path.display(),
            config.simulation.sample_size,
            config.simulation.outcome_family
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::model::{Family, VarianceCriterion};
    use crate::montecarlo::FitModelChoice;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const STUDY: &str = r#"
[simulation]
sample_size = 2000
male_probability = 0.5
odds_ratio_sex = 1.05
odds_ratio_age = 1.10
age_delta = 15.0
reference_prevalence = 0.25
reference_age = 50.0
age_range = [48.0, 80.0]
seed = 42

[simulation.clustering]
labels = ["a", "b", "c"]
weights = [1.0, 2.0, 2.0]
intercept_sd = 2.0

[monte_carlo]
replicates = 20
model = "fixed_only"

[monte_carlo.fit]
criterion = "maximum_likelihood"
"#;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_full_study() {
        let file = write_temp(STUDY);
        let study = StudyConfig::load(file.path()).unwrap();
        assert_eq!(study.simulation.sample_size, 2000);
        assert_eq!(study.simulation.age_range, (48.0, 80.0));
        assert_eq!(study.simulation.outcome_family, Family::Logistic);
        assert_eq!(study.simulation.seed, Some(42));
        let clustering = study.simulation.clustering.as_ref().unwrap();
        assert_eq!(clustering.labels.len(), 3);
        assert_eq!(study.monte_carlo.replicates, 20);
        assert_eq!(study.monte_carlo.model, FitModelChoice::FixedOnly);
        assert_eq!(
            study.monte_carlo.fit.criterion,
            VarianceCriterion::MaximumLikelihood
        );
        assert_eq!(study.monte_carlo.max_failure_fraction, 0.1);
    }

    #[test]
    fn monte_carlo_table_is_optional() {
        let simulation_only = STUDY
            .split("[monte_carlo]")
            .next()
            .unwrap()
            .to_string();
        let file = write_temp(&simulation_only);
        let study = StudyConfig::load(file.path()).unwrap();
        assert_eq!(study.monte_carlo, MonteCarloConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_temp(&STUDY.replace("age_delta", "age_step"));
        assert!(matches!(
            StudyConfig::load(file.path()),
            Err(ConfigError::Toml { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StudyConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
