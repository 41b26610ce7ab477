#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod batch;
pub mod data;
pub mod features;
pub mod forest;
pub mod metrics;
pub mod model;
pub mod scaler;
pub mod split;
pub mod store;

pub use data::{ApplicationRecord, ApplicationTable, TrainingSet};
pub use model::{Decision, FittedPipeline, Prediction, Predictor, PredictorError, Scorer};
