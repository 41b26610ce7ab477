//! # Predictor
//!
//! The single owner of fitted state. A `Predictor` starts out empty and becomes
//! ready exactly once, either by training or by loading persisted artifacts.
//! After that its `FittedPipeline` is never mutated again, so one instance can be
//! shared across threads for scoring.
//!
//! Scoring always runs the same chain: impute and engineer features, align them
//! to the persisted schema, standardize, and average the forest's tree votes.

use crate::data::{ApplicationRecord, DataError, TrainingSet};
use crate::features::{FeatureError, FeatureSchema, FeatureTransformer};
use crate::forest::{ForestConfig, ForestError, RandomForest};
use crate::metrics::{MetricsBundle, MetricsError};
use crate::scaler::{ScalerError, StandardScaler};
use crate::split::{SplitError, stratified_split};
use crate::store::{self, StoreError};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("model not loaded")]
    NotReady,
    #[error("A model is already loaded; create a new predictor to train or load another.")]
    AlreadyFitted,
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("Scaler error: {0}")]
    Scaler(#[from] ScalerError),
    #[error("Classifier error: {0}")]
    Forest(#[from] ForestError),
    #[error("Split error: {0}")]
    Split(#[from] SplitError),
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Model store error: {0}")]
    Store(#[from] StoreError),
}

/// Settings for one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub forest: ForestConfig,
    /// Fraction of rows held out for evaluation.
    pub test_fraction: f64,
    pub split_seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            forest: ForestConfig::default(),
            test_fraction: 0.2,
            split_seed: 42,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn from_class(class: u8) -> Self {
        if class == 1 { Self::Approved } else { Self::Rejected }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of scoring one application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: Decision,
    /// Probability of approval.
    pub probability: f64,
    /// Probability of the predicted class, always at least 0.5.
    pub confidence: f64,
}

impl Prediction {
    pub fn from_probability(probability: f64) -> Self {
        Self {
            prediction: Decision::from_class(RandomForest::classify(probability)),
            probability,
            confidence: probability.max(1.0 - probability),
        }
    }
}

/// Stages reported while training.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainingStage {
    Encoding,
    Scaling,
    Forest,
    Evaluation,
}

impl TrainingStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Encoding => "feature encoding",
            Self::Scaling => "feature standardization",
            Self::Forest => "random forest growth",
            Self::Evaluation => "held-out evaluation",
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress while a model is trained.
pub trait TrainingObserver {
    fn on_stage_start(&mut self, stage: TrainingStage, samples: usize) {
        let _ = (stage, samples);
    }
    fn on_stage_finish(&mut self, stage: TrainingStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopTrainingObserver;

impl TrainingObserver for NoopTrainingObserver {}

/// Anything that can turn an application into a prediction.
pub trait Scorer: Sync {
    fn score(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError>;
}

/// All state produced by one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedPipeline {
    schema: FeatureSchema,
    transformer: FeatureTransformer,
    scaler: StandardScaler,
    forest: RandomForest,
    metrics: MetricsBundle,
}

impl FittedPipeline {
    /// Fits encoders on every record, then holds out a stratified fraction,
    /// fits the scaler and forest on the rest, and evaluates on the held-out rows.
    pub fn fit(
        data: &TrainingSet,
        config: &TrainingConfig,
        observer: &mut dyn TrainingObserver,
    ) -> Result<Self, PredictorError> {
        config.forest.validate()?;
        let schema = FeatureSchema::canonical();
        log::info!("Training on {} records", data.len());

        observer.on_stage_start(TrainingStage::Encoding, data.len());
        let transformer = FeatureTransformer::fit(&data.records)?;
        let x = transformer.transform_matrix(&data.records, &schema)?;
        observer.on_stage_finish(TrainingStage::Encoding);

        let split = stratified_split(data.labels.view(), config.test_fraction, config.split_seed)?;
        let x_train = x.select(Axis(0), &split.train);
        let x_test = x.select(Axis(0), &split.test);
        let y_train = data.labels.select(Axis(0), &split.train);
        let y_test = data.labels.select(Axis(0), &split.test);
        log::info!(
            "Split into {} training and {} held-out records",
            split.train.len(),
            split.test.len()
        );

        observer.on_stage_start(TrainingStage::Scaling, split.train.len());
        let mut scaler = StandardScaler::new();
        scaler.fit(x_train.view())?;
        let x_train = scaler.transform(x_train.view())?;
        let x_test = scaler.transform(x_test.view())?;
        observer.on_stage_finish(TrainingStage::Scaling);

        observer.on_stage_start(TrainingStage::Forest, split.train.len());
        let forest = RandomForest::fit(x_train.view(), y_train.view(), &config.forest)?;
        observer.on_stage_finish(TrainingStage::Forest);

        observer.on_stage_start(TrainingStage::Evaluation, split.test.len());
        let probabilities = forest.predict_proba(x_test.view())?;
        let predicted = probabilities.mapv(RandomForest::classify);
        let metrics = MetricsBundle::evaluate(
            y_test.view(),
            predicted.view(),
            probabilities.view(),
            forest.feature_importances(),
            schema.columns(),
            split.train.len(),
        )?;
        observer.on_stage_finish(TrainingStage::Evaluation);

        Ok(Self {
            schema,
            transformer,
            scaler,
            forest,
            metrics,
        })
    }

    /// Assembles a pipeline from parts that `store` has already cross-checked.
    pub(crate) fn from_parts(
        schema: FeatureSchema,
        transformer: FeatureTransformer,
        scaler: StandardScaler,
        forest: RandomForest,
        metrics: MetricsBundle,
    ) -> Self {
        Self {
            schema,
            transformer,
            scaler,
            forest,
            metrics,
        }
    }

    pub fn predict(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError> {
        let features = self.transformer.transform(record)?.align(&self.schema);
        let scaled = self.scaler.transform_row(features.view())?;
        let probabilities = self.forest.predict_proba(scaled.view().insert_axis(Axis(0)))?;
        Ok(Prediction::from_probability(probabilities[0]))
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn forest(&self) -> &RandomForest {
        &self.forest
    }

    pub fn metrics(&self) -> &MetricsBundle {
        &self.metrics
    }
}

impl Scorer for FittedPipeline {
    fn score(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError> {
        self.predict(record)
    }
}

/// Owns the fitted pipeline once one exists.
#[derive(Debug, Default)]
pub struct Predictor {
    pipeline: Option<FittedPipeline>,
}

impl Predictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Trains a model and returns its held-out metrics.
    pub fn train(
        &mut self,
        data: &TrainingSet,
        config: &TrainingConfig,
        observer: &mut dyn TrainingObserver,
    ) -> Result<&MetricsBundle, PredictorError> {
        if self.pipeline.is_some() {
            return Err(PredictorError::AlreadyFitted);
        }
        let pipeline = self.pipeline.insert(FittedPipeline::fit(data, config, observer)?);
        Ok(pipeline.metrics())
    }

    /// Loads persisted artifacts from `directory`.
    pub fn load(&mut self, directory: &Path) -> Result<(), PredictorError> {
        if self.pipeline.is_some() {
            return Err(PredictorError::AlreadyFitted);
        }
        self.pipeline = Some(store::load(directory)?);
        Ok(())
    }

    pub fn save(&self, directory: &Path) -> Result<(), PredictorError> {
        store::save(self.pipeline()?, directory)?;
        Ok(())
    }

    pub fn predict(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError> {
        self.pipeline()?.predict(record)
    }

    pub fn metrics(&self) -> Result<&MetricsBundle, PredictorError> {
        Ok(self.pipeline()?.metrics())
    }

    pub fn feature_columns(&self) -> Result<&[String], PredictorError> {
        Ok(self.pipeline()?.schema().columns())
    }

    pub fn pipeline(&self) -> Result<&FittedPipeline, PredictorError> {
        self.pipeline.as_ref().ok_or(PredictorError::NotReady)
    }
}

impl Scorer for Predictor {
    fn score(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError> {
        self.predict(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::MAX_SEED;
    use ndarray::Array1;

    fn synthetic_training_set(n: usize) -> TrainingSet {
        let mut records = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let good_credit = i % 4 != 0;
            records.push(ApplicationRecord {
                gender: Some(if i % 2 == 0 { "Male" } else { "Female" }.to_string()),
                property_area: Some(["Urban", "Rural", "Semiurban"][i % 3].to_string()),
                applicant_income: Some(3000.0 + (i * 37 % 401) as f64 * 10.0),
                loan_amount: Some(100.0 + (i * 13 % 51) as f64),
                credit_history: Some(if good_credit { 1.0 } else { 0.0 }),
                ..ApplicationRecord::default()
            });
            labels.push(u8::from(good_credit));
        }
        TrainingSet {
            records,
            labels: Array1::from_vec(labels),
        }
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            forest: ForestConfig {
                n_trees: 15,
                ..ForestConfig::default()
            },
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn predictor_is_not_ready_until_trained() {
        let predictor = Predictor::new();
        assert!(!predictor.is_ready());
        assert!(matches!(
            predictor.predict(&ApplicationRecord::default()),
            Err(PredictorError::NotReady)
        ));
        assert!(matches!(predictor.metrics(), Err(PredictorError::NotReady)));
        assert!(matches!(
            predictor.feature_columns(),
            Err(PredictorError::NotReady)
        ));
        assert_eq!(PredictorError::NotReady.to_string(), "model not loaded");
    }

    #[test]
    fn trained_predictor_learns_credit_history() {
        let data = synthetic_training_set(120);
        let mut predictor = Predictor::new();
        let metrics = predictor
            .train(&data, &small_config(), &mut NoopTrainingObserver)
            .unwrap();
        assert!(metrics.accuracy > 0.9, "accuracy {}", metrics.accuracy);
        assert_eq!(metrics.train_samples + metrics.test_samples, 120);
        assert_eq!(metrics.feature_importance[0].feature, "Credit_History");

        let good = ApplicationRecord {
            credit_history: Some(1.0),
            ..ApplicationRecord::default()
        };
        let bad = ApplicationRecord {
            credit_history: Some(0.0),
            ..ApplicationRecord::default()
        };
        assert_eq!(predictor.predict(&good).unwrap().prediction, Decision::Approved);
        assert_eq!(predictor.predict(&bad).unwrap().prediction, Decision::Rejected);
    }

    #[test]
    fn training_twice_is_refused() {
        let data = synthetic_training_set(60);
        let mut predictor = Predictor::new();
        predictor
            .train(&data, &small_config(), &mut NoopTrainingObserver)
            .unwrap();
        assert!(matches!(
            predictor.train(&data, &small_config(), &mut NoopTrainingObserver),
            Err(PredictorError::AlreadyFitted)
        ));
    }

    #[test]
    fn oversized_seed_is_refused_before_training() {
        let data = synthetic_training_set(60);
        let mut config = small_config();
        config.forest.seed = u64::MAX;
        let mut predictor = Predictor::new();
        assert!(matches!(
            predictor.train(&data, &config, &mut NoopTrainingObserver),
            Err(PredictorError::Forest(ForestError::InvalidConfig(_)))
        ));
        assert!(!predictor.is_ready());
    }

    #[test]
    fn largest_seed_saves_and_reloads() {
        let data = synthetic_training_set(60);
        let mut config = small_config();
        config.forest.seed = MAX_SEED;
        let mut predictor = Predictor::new();
        predictor
            .train(&data, &config, &mut NoopTrainingObserver)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        predictor.save(dir.path()).unwrap();
        let mut restored = Predictor::new();
        restored.load(dir.path()).unwrap();
        assert_eq!(restored.pipeline().unwrap(), predictor.pipeline().unwrap());
    }

    #[test]
    fn confidence_is_the_larger_class_probability() {
        let low = Prediction::from_probability(0.2);
        assert_eq!(low.prediction, Decision::Rejected);
        assert!((low.confidence - 0.8).abs() < 1e-12);

        let tie = Prediction::from_probability(0.5);
        assert_eq!(tie.prediction, Decision::Rejected);
        assert_eq!(tie.confidence, 0.5);
    }

    #[derive(Default)]
    struct RecordingObserver {
        started: Vec<TrainingStage>,
        finished: Vec<TrainingStage>,
    }

    impl TrainingObserver for RecordingObserver {
        fn on_stage_start(&mut self, stage: TrainingStage, samples: usize) {
            assert!(samples > 0);
            self.started.push(stage);
        }
        fn on_stage_finish(&mut self, stage: TrainingStage) {
            self.finished.push(stage);
        }
    }

    #[test]
    fn observer_sees_every_stage_in_order() {
        let data = synthetic_training_set(60);
        let mut observer = RecordingObserver::default();
        FittedPipeline::fit(&data, &small_config(), &mut observer).unwrap();
        let expected = vec![
            TrainingStage::Encoding,
            TrainingStage::Scaling,
            TrainingStage::Forest,
            TrainingStage::Evaluation,
        ];
        assert_eq!(observer.started, expected);
        assert_eq!(observer.finished, expected);
    }
}
