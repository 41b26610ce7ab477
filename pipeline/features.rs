//! Feature engineering: imputation, derived ratios, and categorical encoding.
//!
//! The transformer is a pure function of the input record and the encoder state
//! fitted at training time. Its output is always aligned to a `FeatureSchema`,
//! the ordered list of feature names that is persisted next to the model and
//! checked again when the model is loaded.

use crate::data::{ApplicationRecord, CategoricalField, NumericField};
use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const TOTAL_INCOME: &str = "TotalIncome";
pub const LOAN_AMOUNT_TO_INCOME: &str = "LoanAmountToIncome";
pub const EMI: &str = "EMI";

/// Bumped whenever the feature list or its encoding changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Cannot fit the feature transformer on an empty set of records.")]
    NoRecords,
    #[error("No category encoder was fitted for column '{0}'.")]
    MissingEncoder(String),
    #[error("Classes of the encoder for column '{0}' are not sorted and unique.")]
    UnorderedClasses(String),
}

/// Maps the string values of one categorical column to integer codes.
///
/// Classes are kept sorted, so code `i` is the `i`-th smallest value seen during
/// training. Values never seen during training fall back to code 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<'a, I>(values: I) -> Result<Self, FeatureError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let classes: Vec<String> = values
            .into_iter()
            .sorted_unstable()
            .dedup()
            .map(str::to_string)
            .collect();
        if classes.is_empty() {
            return Err(FeatureError::NoRecords);
        }
        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn knows(&self, value: &str) -> bool {
        self.lookup(value).is_some()
    }

    /// Integer code of `value`, or the first known class for unseen values.
    pub fn encode(&self, value: &str) -> usize {
        self.lookup(value).unwrap_or(0)
    }

    fn lookup(&self, value: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .ok()
    }
}

/// One fitted encoder per categorical column, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderRegistry {
    encoders: BTreeMap<String, CategoryEncoder>,
}

impl EncoderRegistry {
    pub fn get(&self, field: CategoricalField) -> Option<&CategoryEncoder> {
        self.encoders.get(field.column_name())
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    /// Fails unless every categorical column has an encoder with at least one
    /// class, listed in strictly increasing order.
    pub fn validate(&self) -> Result<(), FeatureError> {
        for field in CategoricalField::ALL {
            let classes = match self.get(field) {
                Some(encoder) if !encoder.classes().is_empty() => encoder.classes(),
                _ => return Err(FeatureError::MissingEncoder(field.column_name().to_string())),
            };
            if !classes.windows(2).all(|pair| pair[0] < pair[1]) {
                return Err(FeatureError::UnorderedClasses(
                    field.column_name().to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// The ordered list of model inputs, fixed at training time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub columns: Vec<String>,
}

impl FeatureSchema {
    /// The schema produced by this version of the transformer: the applicant
    /// columns in dataset order followed by the engineered columns.
    pub fn canonical() -> Self {
        let columns = [
            CategoricalField::Gender.column_name(),
            CategoricalField::Married.column_name(),
            CategoricalField::Dependents.column_name(),
            CategoricalField::Education.column_name(),
            CategoricalField::SelfEmployed.column_name(),
            NumericField::ApplicantIncome.column_name(),
            NumericField::CoapplicantIncome.column_name(),
            NumericField::LoanAmount.column_name(),
            NumericField::LoanAmountTerm.column_name(),
            NumericField::CreditHistory.column_name(),
            CategoricalField::PropertyArea.column_name(),
            TOTAL_INCOME,
            LOAN_AMOUNT_TO_INCOME,
            EMI,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            version: SCHEMA_VERSION,
            columns,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A record with every field filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedRecord {
    categories: [String; CategoricalField::COUNT],
    numerics: [f64; NumericField::COUNT],
}

impl ImputedRecord {
    pub fn from_record(record: &ApplicationRecord) -> Self {
        let categories = CategoricalField::ALL.map(|field| {
            record
                .categorical(field)
                .unwrap_or(field.default_value())
                .to_string()
        });
        let numerics = NumericField::ALL.map(|field| {
            let value = record
                .numeric(field)
                .filter(|value| !value.is_nan())
                .unwrap_or(field.default_value());
            finite_or_zero(value)
        });
        Self {
            categories,
            numerics,
        }
    }

    pub fn category(&self, field: CategoricalField) -> &str {
        &self.categories[field.index()]
    }

    pub fn numeric(&self, field: NumericField) -> f64 {
        self.numerics[field.index()]
    }
}

/// Named, fully numeric features of one record, before alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineeredFeatures {
    named: Vec<(&'static str, f64)>,
}

impl EngineeredFeatures {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.named
            .iter()
            .find(|(feature, _)| *feature == name)
            .map(|&(_, value)| value)
    }

    /// Reorders the features to match `schema`. Names the schema lists but this
    /// record lacks are filled with 0.
    pub fn align(&self, schema: &FeatureSchema) -> Array1<f64> {
        schema
            .columns()
            .iter()
            .map(|name| self.get(name).unwrap_or(0.0))
            .collect()
    }
}

/// Imputation, feature engineering, and categorical encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTransformer {
    encoders: EncoderRegistry,
}

impl FeatureTransformer {
    /// Fits one encoder per categorical column over the imputed training records.
    pub fn fit(records: &[ApplicationRecord]) -> Result<Self, FeatureError> {
        if records.is_empty() {
            return Err(FeatureError::NoRecords);
        }

        let imputed: Vec<ImputedRecord> = records.iter().map(ImputedRecord::from_record).collect();
        let mut encoders = BTreeMap::new();
        for field in CategoricalField::ALL {
            let encoder = CategoryEncoder::fit(imputed.iter().map(|record| record.category(field)))?;
            log::debug!(
                "Fitted encoder for '{}' with classes {:?}",
                field.column_name(),
                encoder.classes()
            );
            encoders.insert(field.column_name().to_string(), encoder);
        }

        Ok(Self {
            encoders: EncoderRegistry { encoders },
        })
    }

    pub fn from_encoders(encoders: EncoderRegistry) -> Self {
        Self { encoders }
    }

    pub fn encoders(&self) -> &EncoderRegistry {
        &self.encoders
    }

    /// Produces the engineered features of one record.
    pub fn transform(&self, record: &ApplicationRecord) -> Result<EngineeredFeatures, FeatureError> {
        let imputed = ImputedRecord::from_record(record);
        let mut named = Vec::with_capacity(CategoricalField::COUNT + NumericField::COUNT + 3);

        for field in CategoricalField::ALL {
            let encoder = self
                .encoders
                .get(field)
                .ok_or_else(|| FeatureError::MissingEncoder(field.column_name().to_string()))?;
            let value = imputed.category(field);
            if !encoder.knows(value) {
                log::debug!(
                    "Unseen value '{}' in column '{}'; using '{}'",
                    value,
                    field.column_name(),
                    encoder.classes()[0]
                );
            }
            named.push((field.column_name(), encoder.encode(value) as f64));
        }

        for field in NumericField::ALL {
            named.push((field.column_name(), imputed.numeric(field)));
        }

        let applicant = imputed.numeric(NumericField::ApplicantIncome);
        let coapplicant = imputed.numeric(NumericField::CoapplicantIncome);
        let amount = imputed.numeric(NumericField::LoanAmount);
        let term = imputed.numeric(NumericField::LoanAmountTerm);

        let total_income = applicant + coapplicant;
        named.push((TOTAL_INCOME, finite_or_zero(total_income)));
        named.push((LOAN_AMOUNT_TO_INCOME, finite_or_zero(amount / (total_income + 1.0))));
        named.push((EMI, finite_or_zero(amount / (term + 1.0))));

        Ok(EngineeredFeatures { named })
    }

    /// Builds the `[n_records, schema.len()]` feature matrix.
    pub fn transform_matrix(
        &self,
        records: &[ApplicationRecord],
        schema: &FeatureSchema,
    ) -> Result<Array2<f64>, FeatureError> {
        let mut matrix = Array2::zeros((records.len(), schema.len()));
        for (mut row, record) in matrix.rows_mut().into_iter().zip(records) {
            row.assign(&self.transform(record)?.align(schema));
        }
        Ok(matrix)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}
