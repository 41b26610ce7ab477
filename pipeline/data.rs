//! # Application Data Module
//!
//! This module is the single entry point for applicant data, whether it arrives
//! as a CSV file (training sets and batch requests) or as one JSON object (a
//! single prediction request). It owns the catalogue of applicant fields and
//! their documented defaults, so every other stage can rely on one definition.
//!
//! - Fixed Column Names: The module expects the column names of the public
//!   loan dataset (`Gender`, `ApplicantIncome`, `Loan_Status`, ...). They are
//!   not configurable.
//! - Row-Level Errors: Cells are read as text and converted per row, so a bad
//!   value only poisons the row that contains it. Batch scoring depends on this.
//! - Missing Is Not Malformed: Empty cells and the usual missing markers
//!   (`NA`, `NaN`, `null`, ...) become absent fields and are imputed later.

use ndarray::Array1;
use polars::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Identifier column. Metadata only, never a feature.
pub const ID_COLUMN: &str = "Loan_ID";

/// Binary outcome column of a training set (`Y` or `N`).
pub const LABEL_COLUMN: &str = "Loan_Status";

/// Training sets smaller than this are rejected outright.
pub const MINIMUM_TRAINING_ROWS: usize = 20;

/// Cell contents that are treated as a missing value.
const MISSING_MARKERS: [&str; 8] = ["na", "n/a", "nan", "null", "none", "-nan", "<na>", "#n/a"];

/// The categorical applicant attributes, in dataset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CategoricalField {
    Gender,
    Married,
    Dependents,
    Education,
    SelfEmployed,
    PropertyArea,
}

impl CategoricalField {
    pub const COUNT: usize = 6;

    pub const ALL: [CategoricalField; Self::COUNT] = [
        Self::Gender,
        Self::Married,
        Self::Dependents,
        Self::Education,
        Self::SelfEmployed,
        Self::PropertyArea,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Self::Gender => "Gender",
            Self::Married => "Married",
            Self::Dependents => "Dependents",
            Self::Education => "Education",
            Self::SelfEmployed => "Self_Employed",
            Self::PropertyArea => "Property_Area",
        }
    }

    /// Value imputed when the field is absent.
    pub fn default_value(self) -> &'static str {
        match self {
            Self::Gender => "Male",
            Self::Married => "Yes",
            Self::Dependents => "0",
            Self::Education => "Graduate",
            Self::SelfEmployed => "No",
            Self::PropertyArea => "Semiurban",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The numeric applicant attributes, in dataset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NumericField {
    ApplicantIncome,
    CoapplicantIncome,
    LoanAmount,
    LoanAmountTerm,
    CreditHistory,
}

impl NumericField {
    pub const COUNT: usize = 5;

    pub const ALL: [NumericField; Self::COUNT] = [
        Self::ApplicantIncome,
        Self::CoapplicantIncome,
        Self::LoanAmount,
        Self::LoanAmountTerm,
        Self::CreditHistory,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Self::ApplicantIncome => "ApplicantIncome",
            Self::CoapplicantIncome => "CoapplicantIncome",
            Self::LoanAmount => "LoanAmount",
            Self::LoanAmountTerm => "Loan_Amount_Term",
            Self::CreditHistory => "Credit_History",
        }
    }

    /// Value imputed when the field is absent or not finite.
    pub fn default_value(self) -> f64 {
        match self {
            Self::ApplicantIncome => 5000.0,
            Self::CoapplicantIncome => 0.0,
            Self::LoanAmount => 120.0,
            Self::LoanAmountTerm => 360.0,
            Self::CreditHistory => 1.0,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// One loan application. Every field may be absent.
///
/// The serde names are the dataset column names, so a JSON request body such as
/// `{"Gender": "Male", "ApplicantIncome": 5000}` deserializes directly. Numbers
/// sent as strings and categories sent as numbers are both accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    #[serde(rename = "Loan_ID", default, deserialize_with = "lenient_text")]
    pub loan_id: Option<String>,
    #[serde(rename = "Gender", default, deserialize_with = "lenient_text")]
    pub gender: Option<String>,
    #[serde(rename = "Married", default, deserialize_with = "lenient_text")]
    pub married: Option<String>,
    #[serde(rename = "Dependents", default, deserialize_with = "lenient_text")]
    pub dependents: Option<String>,
    #[serde(rename = "Education", default, deserialize_with = "lenient_text")]
    pub education: Option<String>,
    #[serde(rename = "Self_Employed", default, deserialize_with = "lenient_text")]
    pub self_employed: Option<String>,
    #[serde(rename = "ApplicantIncome", default, deserialize_with = "lenient_number")]
    pub applicant_income: Option<f64>,
    #[serde(rename = "CoapplicantIncome", default, deserialize_with = "lenient_number")]
    pub coapplicant_income: Option<f64>,
    #[serde(rename = "LoanAmount", default, deserialize_with = "lenient_number")]
    pub loan_amount: Option<f64>,
    #[serde(rename = "Loan_Amount_Term", default, deserialize_with = "lenient_number")]
    pub loan_amount_term: Option<f64>,
    #[serde(rename = "Credit_History", default, deserialize_with = "lenient_number")]
    pub credit_history: Option<f64>,
    #[serde(rename = "Property_Area", default, deserialize_with = "lenient_text")]
    pub property_area: Option<String>,
}

impl ApplicationRecord {
    pub fn categorical(&self, field: CategoricalField) -> Option<&str> {
        let value = match field {
            CategoricalField::Gender => &self.gender,
            CategoricalField::Married => &self.married,
            CategoricalField::Dependents => &self.dependents,
            CategoricalField::Education => &self.education,
            CategoricalField::SelfEmployed => &self.self_employed,
            CategoricalField::PropertyArea => &self.property_area,
        };
        value.as_deref()
    }

    pub fn numeric(&self, field: NumericField) -> Option<f64> {
        match field {
            NumericField::ApplicantIncome => self.applicant_income,
            NumericField::CoapplicantIncome => self.coapplicant_income,
            NumericField::LoanAmount => self.loan_amount,
            NumericField::LoanAmountTerm => self.loan_amount_term,
            NumericField::CreditHistory => self.credit_history,
        }
    }

    pub fn set_categorical(&mut self, field: CategoricalField, value: Option<String>) {
        let slot = match field {
            CategoricalField::Gender => &mut self.gender,
            CategoricalField::Married => &mut self.married,
            CategoricalField::Dependents => &mut self.dependents,
            CategoricalField::Education => &mut self.education,
            CategoricalField::SelfEmployed => &mut self.self_employed,
            CategoricalField::PropertyArea => &mut self.property_area,
        };
        *slot = value;
    }

    pub fn set_numeric(&mut self, field: NumericField, value: Option<f64>) {
        let slot = match field {
            NumericField::ApplicantIncome => &mut self.applicant_income,
            NumericField::CoapplicantIncome => &mut self.coapplicant_income,
            NumericField::LoanAmount => &mut self.loan_amount,
            NumericField::LoanAmountTerm => &mut self.loan_amount_term,
            NumericField::CreditHistory => &mut self.credit_history,
        };
        *slot = value;
    }

    /// Parses a single JSON object into a record.
    pub fn from_json(text: &str) -> Result<Self, DataError> {
        if text.trim().is_empty() {
            return Err(DataError::EmptyInput);
        }
        serde_json::from_str(text).map_err(|e| DataError::InvalidJson(e.to_string()))
    }
}

/// A comprehensive error type for data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("No data provided.")]
    EmptyInput,
    #[error("File '{0}' must be a CSV file.")]
    NotCsv(String),
    #[error("Request body is not a valid application record: {0}")]
    InvalidJson(String),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Row {row}: column '{column}' holds '{value}', which is not a number.")]
    MalformedValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Row {row}: the 'Loan_Status' value is missing.")]
    MissingLabel { row: usize },
    #[error("Row {row}: the 'Loan_Status' value '{value}' is not 'Y' or 'N'.")]
    InvalidLabel { row: usize, value: String },
    #[error(
        "Input file contains only {found} data rows, but at least {required} are required to train a model."
    )]
    InsufficientRows { found: usize, required: usize },
    #[error("Every training row has Loan_Status '{0}'; both 'Y' and 'N' outcomes are required.")]
    SingleClass(char),
}

/// Applicant rows held as text, exactly as they were read.
///
/// Conversion into `ApplicationRecord` happens per row through `record`, which is
/// what keeps one malformed row from taking the whole table down with it.
#[derive(Debug, Clone, Default)]
pub struct ApplicationTable {
    positions: HashMap<String, usize>,
    rows: Vec<Vec<Option<String>>>,
}

impl ApplicationTable {
    /// Builds a table from already-split cells. Cells are normalized the same way
    /// file input is: trimmed, with missing markers mapped to `None`.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let positions = columns
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        let rows = rows
            .into_iter()
            .map(|cells| {
                cells
                    .into_iter()
                    .map(|cell| cell.as_deref().and_then(normalize_cell))
                    .collect()
            })
            .collect();
        Self { positions, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Returns the cell at `row` (0-based) in column `name`, if present and non-missing.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let position = *self.positions.get(name)?;
        self.rows.get(row)?.get(position)?.as_deref()
    }

    /// The row's `Loan_ID`, or its 1-based position when the identifier is absent.
    pub fn row_identifier(&self, row: usize) -> String {
        match self.cell(row, ID_COLUMN) {
            Some(id) => id.to_string(),
            None => (row + 1).to_string(),
        }
    }

    /// Converts one row into a record. Unknown columns are ignored.
    pub fn record(&self, row: usize) -> Result<ApplicationRecord, DataError> {
        let mut record = ApplicationRecord {
            loan_id: self.cell(row, ID_COLUMN).map(str::to_string),
            ..ApplicationRecord::default()
        };

        for field in CategoricalField::ALL {
            record.set_categorical(
                field,
                self.cell(row, field.column_name()).map(str::to_string),
            );
        }

        for field in NumericField::ALL {
            let value = match self.cell(row, field.column_name()) {
                Some(text) => Some(parse_number(text).ok_or_else(|| DataError::MalformedValue {
                    row: row + 1,
                    column: field.column_name().to_string(),
                    value: text.to_string(),
                })?),
                None => None,
            };
            record.set_numeric(field, value);
        }

        Ok(record)
    }

    /// Reads the binary outcome of one row: `Y` is 1, `N` is 0.
    pub fn label(&self, row: usize) -> Result<u8, DataError> {
        match self.cell(row, LABEL_COLUMN) {
            Some("Y") => Ok(1),
            Some("N") => Ok(0),
            Some(other) => Err(DataError::InvalidLabel {
                row: row + 1,
                value: other.to_string(),
            }),
            None => Err(DataError::MissingLabel { row: row + 1 }),
        }
    }
}

/// A validated, labeled training set.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub records: Vec<ApplicationRecord>,
    /// 1 = approved, 0 = rejected.
    pub labels: Array1<u8>,
}

impl TrainingSet {
    /// Validates a table for training. The outcome column must exist, and every
    /// row must carry a valid label and well-formed numeric cells.
    pub fn from_table(table: &ApplicationTable) -> Result<Self, DataError> {
        if !table.has_column(LABEL_COLUMN) {
            return Err(DataError::ColumnNotFound(LABEL_COLUMN.to_string()));
        }
        if table.len() < MINIMUM_TRAINING_ROWS {
            return Err(DataError::InsufficientRows {
                found: table.len(),
                required: MINIMUM_TRAINING_ROWS,
            });
        }

        let mut records = Vec::with_capacity(table.len());
        let mut labels = Vec::with_capacity(table.len());
        for row in 0..table.len() {
            records.push(table.record(row)?);
            labels.push(table.label(row)?);
        }

        let approved = labels.iter().filter(|&&label| label == 1).count();
        if approved == 0 || approved == labels.len() {
            return Err(DataError::SingleClass(if approved == 0 { 'N' } else { 'Y' }));
        }

        Ok(Self {
            records,
            labels: Array1::from_vec(labels),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Loads and validates a labeled CSV file for model training.
pub fn load_training_data(path: &Path) -> Result<TrainingSet, DataError> {
    let table = load_table(path)?;
    TrainingSet::from_table(&table)
}

/// Loads a CSV file of applications for batch prediction.
pub fn load_batch_data(path: &Path) -> Result<ApplicationTable, DataError> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return Err(DataError::NotCsv(path.display().to_string()));
    }

    let table = load_table(path)?;
    if table.is_empty() {
        return Err(DataError::EmptyInput);
    }
    Ok(table)
}

/// Reads a CSV file with every column as text.
pub fn load_table(path: &Path) -> Result<ApplicationTable, DataError> {
    log::info!("Loading data from '{}'", path.display());

    // A zero-length inference window makes polars read every column as a string.
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0)),
        )
        .finish()?;

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let mut rows: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(columns.len()); df.height()];

    for name in &columns {
        let column = df.column(name.as_str())?.cast(&DataType::String)?;
        let values = column.as_materialized_series().str()?;
        for (row, value) in values.into_iter().enumerate() {
            rows[row].push(value.map(str::to_string));
        }
    }

    log::info!(
        "Loaded {} rows with columns: {:?}",
        rows.len(),
        columns
    );
    Ok(ApplicationTable::from_rows(columns, rows))
}

fn normalize_cell(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty()
        || MISSING_MARKERS
            .iter()
            .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<TextOrNumber>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        TextOrNumber::Text(text) => normalize_cell(&text),
        TextOrNumber::Integer(n) => Some(n.to_string()),
        TextOrNumber::Float(x) => Some(x.to_string()),
        TextOrNumber::Bool(b) => Some(if b { "Yes" } else { "No" }.to_string()),
    }))
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<TextOrNumber>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(TextOrNumber::Integer(n)) => Ok(Some(n as f64)),
        Some(TextOrNumber::Float(x)) => Ok(Some(x)),
        Some(TextOrNumber::Bool(b)) => Ok(Some(if b { 1.0 } else { 0.0 })),
        Some(TextOrNumber::Text(text)) => match normalize_cell(&text) {
            None => Ok(None),
            Some(cell) => parse_number(&cell)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("'{cell}' is not a number"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".csv").tempfile().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write csv");
        file
    }

    fn training_csv(rows: usize) -> String {
        let mut text = String::from(
            "Loan_ID,Gender,Married,Dependents,Education,Self_Employed,ApplicantIncome,CoapplicantIncome,LoanAmount,Loan_Amount_Term,Credit_History,Property_Area,Loan_Status\n",
        );
        for i in 0..rows {
            let status = if i % 3 == 0 { "N" } else { "Y" };
            text.push_str(&format!(
                "LP{i:04},Male,Yes,3+,Graduate,No,{},0,{},360,1,Urban,{status}\n",
                4000 + i * 10,
                100 + i
            ));
        }
        text
    }

    #[test]
    fn table_reads_every_column_as_text() {
        let file = write_csv(
            "Loan_ID,Gender,Dependents,ApplicantIncome,Credit_History\nLP1,Male,3+,5000,1\nLP2,,0,abc,\n",
        );
        let table = load_table(file.path()).expect("load table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, "Dependents"), Some("3+"));
        assert_eq!(table.cell(0, "Credit_History"), Some("1"));
        assert_eq!(table.cell(1, "Gender"), None);
        assert_eq!(table.cell(1, "Credit_History"), None);
    }

    #[test]
    fn malformed_numeric_cell_fails_only_its_row() {
        let table = ApplicationTable::from_rows(
            vec!["Loan_ID".into(), "ApplicantIncome".into()],
            vec![
                vec![Some("LP1".into()), Some("5000".into())],
                vec![Some("LP2".into()), Some("lots".into())],
            ],
        );
        assert_eq!(table.record(0).unwrap().applicant_income, Some(5000.0));
        match table.record(1) {
            Err(DataError::MalformedValue { row, column, value }) => {
                assert_eq!(row, 2);
                assert_eq!(column, "ApplicantIncome");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_markers_become_absent_fields() {
        let table = ApplicationTable::from_rows(
            vec!["Gender".into(), "LoanAmount".into()],
            vec![vec![Some(" NA ".into()), Some("NaN".into())]],
        );
        let record = table.record(0).unwrap();
        assert_eq!(record.gender, None);
        assert_eq!(record.loan_amount, None);
    }

    #[test]
    fn identifiers_fall_back_to_one_based_positions() {
        let table = ApplicationTable::from_rows(
            vec!["Gender".into()],
            vec![vec![Some("Male".into())], vec![Some("Female".into())]],
        );
        assert_eq!(table.row_identifier(0), "1");
        assert_eq!(table.row_identifier(1), "2");

        let with_ids = ApplicationTable::from_rows(
            vec!["Loan_ID".into()],
            vec![vec![Some("LP001002".into())], vec![None]],
        );
        assert_eq!(with_ids.row_identifier(0), "LP001002");
        assert_eq!(with_ids.row_identifier(1), "2");
    }

    #[test]
    fn training_requires_the_label_column() {
        let text = training_csv(25).replace(",Loan_Status", ",Outcome");
        let file = write_csv(&text);
        match load_training_data(file.path()) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, LABEL_COLUMN),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn training_rejects_unknown_labels() {
        let text = training_csv(25).replacen(",N\n", ",Maybe\n", 1);
        let file = write_csv(&text);
        match load_training_data(file.path()) {
            Err(DataError::InvalidLabel { row, value }) => {
                assert_eq!(row, 1);
                assert_eq!(value, "Maybe");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn training_rejects_tiny_files() {
        let file = write_csv(&training_csv(5));
        assert!(matches!(
            load_training_data(file.path()),
            Err(DataError::InsufficientRows { found: 5, .. })
        ));
    }

    #[test]
    fn training_needs_both_outcomes() {
        let text = training_csv(25).replace(",N\n", ",Y\n");
        let file = write_csv(&text);
        assert!(matches!(
            load_training_data(file.path()),
            Err(DataError::SingleClass('Y'))
        ));
    }

    #[test]
    fn training_set_maps_labels() {
        let file = write_csv(&training_csv(30));
        let data = load_training_data(file.path()).expect("training data");
        assert_eq!(data.len(), 30);
        assert_eq!(data.labels[0], 0);
        assert_eq!(data.labels[1], 1);
        assert_eq!(data.records[0].dependents.as_deref(), Some("3+"));
    }

    #[test]
    fn batch_input_must_be_csv() {
        let file = Builder::new().suffix(".txt").tempfile().expect("tempfile");
        assert!(matches!(
            load_batch_data(file.path()),
            Err(DataError::NotCsv(_))
        ));
    }

    #[test]
    fn json_records_accept_loose_types() {
        let record = ApplicationRecord::from_json(
            r#"{"Gender": "Male", "Dependents": 0, "ApplicantIncome": "5000", "Credit_History": 1, "Extra": true}"#,
        )
        .expect("parse record");
        assert_eq!(record.gender.as_deref(), Some("Male"));
        assert_eq!(record.dependents.as_deref(), Some("0"));
        assert_eq!(record.applicant_income, Some(5000.0));
        assert_eq!(record.credit_history, Some(1.0));
        assert_eq!(record.loan_amount, None);
    }

    #[test]
    fn json_records_reject_non_numeric_amounts() {
        assert!(matches!(
            ApplicationRecord::from_json(r#"{"LoanAmount": "plenty"}"#),
            Err(DataError::InvalidJson(_))
        ));
        assert!(matches!(
            ApplicationRecord::from_json("  "),
            Err(DataError::EmptyInput)
        ));
    }
}
