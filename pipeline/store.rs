//! # Model Store
//!
//! A trained pipeline is persisted as five independent TOML files in one
//! directory. All five must be present and mutually consistent for a load to
//! succeed; anything less leaves the caller without a model rather than with a
//! partially restored one.

use crate::features::{EncoderRegistry, FeatureSchema, FeatureTransformer, SCHEMA_VERSION};
use crate::forest::RandomForest;
use crate::metrics::MetricsBundle;
use crate::model::FittedPipeline;
use crate::scaler::StandardScaler;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const MODEL_FILE: &str = "loan_model.toml";
pub const SCALER_FILE: &str = "scaler.toml";
pub const ENCODERS_FILE: &str = "label_encoders.toml";
pub const FEATURES_FILE: &str = "feature_columns.toml";
pub const METRICS_FILE: &str = "model_metrics.toml";

/// Every artifact a load requires.
pub const ARTIFACTS: [&str; 5] = [
    MODEL_FILE,
    SCALER_FILE,
    ENCODERS_FILE,
    FEATURES_FILE,
    METRICS_FILE,
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read or write a model artifact: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize a model artifact to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model artifact '{0}' was not found.")]
    ArtifactMissing(String),
    #[error("Model artifact '{artifact}' is corrupt: {reason}")]
    Corrupt { artifact: String, reason: String },
    #[error(
        "Model artifacts use feature schema version {found}, but this build expects version {expected} with a different column list. Retrain the model."
    )]
    SchemaMismatch { found: u32, expected: u32 },
}

/// True when every artifact file exists under `directory`.
pub fn artifacts_present(directory: &Path) -> bool {
    ARTIFACTS.iter().all(|name| directory.join(name).is_file())
}

/// Writes all artifacts, creating `directory` if needed.
pub fn save(pipeline: &FittedPipeline, directory: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(directory)?;
    write_artifact(directory, MODEL_FILE, pipeline.forest())?;
    write_artifact(directory, SCALER_FILE, pipeline.scaler())?;
    write_artifact(directory, ENCODERS_FILE, pipeline.transformer().encoders())?;
    write_artifact(directory, FEATURES_FILE, pipeline.schema())?;
    write_artifact(directory, METRICS_FILE, pipeline.metrics())?;
    log::info!("Saved model artifacts to '{}'", directory.display());
    Ok(())
}

/// Reads and cross-checks all artifacts under `directory`.
pub fn load(directory: &Path) -> Result<FittedPipeline, StoreError> {
    for name in ARTIFACTS {
        let path = directory.join(name);
        if !path.is_file() {
            return Err(StoreError::ArtifactMissing(path.display().to_string()));
        }
    }

    let schema: FeatureSchema = read_artifact(directory, FEATURES_FILE)?;
    let expected = FeatureSchema::canonical();
    if schema != expected {
        return Err(StoreError::SchemaMismatch {
            found: schema.version,
            expected: SCHEMA_VERSION,
        });
    }

    let encoders: EncoderRegistry = read_artifact(directory, ENCODERS_FILE)?;
    encoders
        .validate()
        .map_err(|e| corrupt(ENCODERS_FILE, e.to_string()))?;

    let scaler: StandardScaler = read_artifact(directory, SCALER_FILE)?;
    let state = scaler
        .state()
        .ok_or_else(|| corrupt(SCALER_FILE, "the scaler was never fitted".to_string()))?;
    if state.mean.len() != schema.len() || state.scale.len() != schema.len() {
        return Err(corrupt(
            SCALER_FILE,
            format!("expected {} columns, found {}", schema.len(), state.mean.len()),
        ));
    }
    if state.scale.iter().any(|&scale| !scale.is_finite() || scale <= 0.0) {
        return Err(corrupt(SCALER_FILE, "non-positive scale".to_string()));
    }

    let forest: RandomForest = read_artifact(directory, MODEL_FILE)?;
    forest
        .validate()
        .map_err(|e| corrupt(MODEL_FILE, e.to_string()))?;
    if forest.n_features() != schema.len() {
        return Err(corrupt(
            MODEL_FILE,
            format!(
                "the forest expects {} features, the schema lists {}",
                forest.n_features(),
                schema.len()
            ),
        ));
    }

    let metrics: MetricsBundle = read_artifact(directory, METRICS_FILE)?;

    log::info!(
        "Loaded a {}-tree model from '{}'",
        forest.n_trees(),
        directory.display()
    );
    Ok(FittedPipeline::from_parts(
        schema,
        FeatureTransformer::from_encoders(encoders),
        scaler,
        forest,
        metrics,
    ))
}

fn write_artifact<T: Serialize>(directory: &Path, name: &str, value: &T) -> Result<(), StoreError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(directory.join(name))?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    log::debug!("Wrote {name} ({} bytes)", toml_string.len());
    Ok(())
}

fn read_artifact<T: DeserializeOwned>(directory: &Path, name: &str) -> Result<T, StoreError> {
    let toml_string = fs::read_to_string(directory.join(name))?;
    toml::from_str(&toml_string).map_err(|e| corrupt(name, e.to_string()))
}

fn corrupt(artifact: &str, reason: String) -> StoreError {
    StoreError::Corrupt {
        artifact: artifact.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_directory_reports_the_first_missing_artifact() {
        let dir = tempdir().unwrap();
        assert!(!artifacts_present(dir.path()));
        match load(dir.path()) {
            Err(StoreError::ArtifactMissing(path)) => assert!(path.ends_with(MODEL_FILE)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unreadable_artifact_is_corrupt() {
        let dir = tempdir().unwrap();
        for name in ARTIFACTS {
            fs::write(dir.path().join(name), "this is = not [valid").unwrap();
        }
        assert!(artifacts_present(dir.path()));
        match load(dir.path()) {
            Err(StoreError::Corrupt { artifact, .. }) => assert_eq!(artifact, FEATURES_FILE),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unsorted_encoder_classes_are_corrupt() {
        let dir = tempdir().unwrap();
        for name in ARTIFACTS {
            fs::write(dir.path().join(name), "").unwrap();
        }
        write_artifact(dir.path(), FEATURES_FILE, &FeatureSchema::canonical()).unwrap();
        fs::write(
            dir.path().join(ENCODERS_FILE),
            "[encoders.Gender]\nclasses = [\"Male\", \"Female\"]\n",
        )
        .unwrap();
        match load(dir.path()) {
            Err(StoreError::Corrupt { artifact, reason }) => {
                assert_eq!(artifact, ENCODERS_FILE);
                assert!(reason.contains("Gender"), "reason: {reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let dir = tempdir().unwrap();
        for name in ARTIFACTS {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let old = FeatureSchema {
            version: 0,
            columns: vec!["Gender".to_string(), "ApplicantIncome".to_string()],
        };
        write_artifact(dir.path(), FEATURES_FILE, &old).unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(StoreError::SchemaMismatch {
                found: 0,
                expected: SCHEMA_VERSION
            })
        ));
    }
}
