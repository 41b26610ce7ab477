//! Row-independent batch scoring.
//!
//! Each row is converted and scored on its own. A row that fails, whether from a
//! malformed cell or a scoring error, becomes an error entry carrying the row's
//! identifier; the rest of the batch is unaffected. Output order always matches
//! input order.

use crate::data::{ApplicationRecord, ApplicationTable, DataError, load_batch_data};
use crate::model::{Decision, Prediction, PredictorError, Scorer};
use polars::prelude::{Column, CsvWriter, DataFrame, NamedFrom, PolarsError, SerWriter, Series};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// `prediction` value of rows that could not be scored.
pub const ERROR_LABEL: &str = "Error";

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch input error: {0}")]
    Data(#[from] DataError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The outcome for one input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub loan_id: String,
    /// `Approved`, `Rejected`, or `Error`.
    pub prediction: String,
    pub probability: Option<f64>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl BatchEntry {
    fn scored(loan_id: String, prediction: Prediction) -> Self {
        Self {
            loan_id,
            prediction: prediction.prediction.to_string(),
            probability: Some(prediction.probability),
            confidence: Some(prediction.confidence),
            error: None,
        }
    }

    fn failed(loan_id: String, error: &PredictorError) -> Self {
        log::warn!("Row '{loan_id}' could not be scored: {error}");
        Self {
            loan_id,
            prediction: ERROR_LABEL.to_string(),
            probability: None,
            confidence: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub errors: usize,
}

/// Loads a CSV batch file and scores every row.
pub fn run_batch<S: Scorer + ?Sized>(
    scorer: &S,
    input: &Path,
) -> Result<Vec<BatchEntry>, BatchError> {
    let table = load_batch_data(input)?;
    Ok(predict_batch(scorer, &table))
}

/// Scores every row of `table`. Rows without a `Loan_ID` are identified by
/// their 1-based position.
pub fn predict_batch<S: Scorer + ?Sized>(scorer: &S, table: &ApplicationTable) -> Vec<BatchEntry> {
    let entries: Vec<BatchEntry> = (0..table.len())
        .into_par_iter()
        .map(|row| {
            let loan_id = table.row_identifier(row);
            let outcome = table
                .record(row)
                .map_err(PredictorError::from)
                .and_then(|record| scorer.score(&record));
            match outcome {
                Ok(prediction) => BatchEntry::scored(loan_id, prediction),
                Err(e) => BatchEntry::failed(loan_id, &e),
            }
        })
        .collect();
    log::info!("Scored {} batch rows", entries.len());
    entries
}

/// Scores already-parsed records, identified the same way as table rows.
pub fn predict_records<S: Scorer + ?Sized>(
    scorer: &S,
    records: &[ApplicationRecord],
) -> Vec<BatchEntry> {
    (0..records.len())
        .into_par_iter()
        .map(|index| {
            let record = &records[index];
            let loan_id = record
                .loan_id
                .clone()
                .unwrap_or_else(|| (index + 1).to_string());
            match scorer.score(record) {
                Ok(prediction) => BatchEntry::scored(loan_id, prediction),
                Err(e) => BatchEntry::failed(loan_id, &e),
            }
        })
        .collect()
}

pub fn summarize(entries: &[BatchEntry]) -> BatchSummary {
    let mut summary = BatchSummary {
        total: entries.len(),
        ..BatchSummary::default()
    };
    for entry in entries {
        if entry.is_error() {
            summary.errors += 1;
        } else if entry.prediction == Decision::Approved.as_str() {
            summary.approved += 1;
        } else {
            summary.rejected += 1;
        }
    }
    summary
}

/// Writes the entries as CSV with a header row.
pub fn write_results(entries: &[BatchEntry], path: &Path) -> Result<(), BatchError> {
    let mut df = DataFrame::new(vec![
        Column::from(Series::new(
            "loan_id".into(),
            entries.iter().map(|e| e.loan_id.as_str()).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            "prediction".into(),
            entries.iter().map(|e| e.prediction.as_str()).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            "probability".into(),
            entries.iter().map(|e| e.probability).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            "confidence".into(),
            entries.iter().map(|e| e.confidence).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            "error".into(),
            entries.iter().map(|e| e.error.as_deref()).collect::<Vec<_>>(),
        )),
    ])?;

    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;
    log::info!("Wrote {} batch results to '{}'", entries.len(), path.display());
    Ok(())
}

/// `batch_predictions_<UTC timestamp>.csv`
pub fn default_export_name() -> String {
    format!(
        "batch_predictions_{}.csv",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Approves any applicant with a clean credit history.
    struct CreditRule;

    impl Scorer for CreditRule {
        fn score(&self, record: &ApplicationRecord) -> Result<Prediction, PredictorError> {
            match record.credit_history {
                Some(value) => Ok(Prediction::from_probability(if value >= 1.0 { 0.9 } else { 0.1 })),
                None => Err(PredictorError::NotReady),
            }
        }
    }

    fn table() -> ApplicationTable {
        ApplicationTable::from_rows(
            vec!["Credit_History".into(), "LoanAmount".into()],
            vec![
                vec![Some("1".into()), Some("100".into())],
                vec![Some("0".into()), Some("not-a-number".into())],
                vec![Some("0".into()), Some("120".into())],
                vec![None, Some("90".into())],
            ],
        )
    }

    #[test]
    fn failures_stay_on_their_own_row() {
        let entries = predict_batch(&CreditRule, &table());
        assert_eq!(entries.len(), 4);
        let ids: Vec<&str> = entries.iter().map(|e| e.loan_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);

        assert_eq!(entries[0].prediction, Decision::Approved.as_str());
        assert_eq!(entries[1].prediction, ERROR_LABEL);
        assert!(entries[1].error.as_deref().unwrap().contains("LoanAmount"));
        assert_eq!(entries[2].prediction, Decision::Rejected.as_str());
        assert!(entries[3].is_error());

        assert_eq!(
            summarize(&entries),
            BatchSummary {
                total: 4,
                approved: 1,
                rejected: 1,
                errors: 2
            }
        );
    }

    #[test]
    fn records_use_their_own_identifiers() {
        let records = vec![
            ApplicationRecord {
                loan_id: Some("LP9".into()),
                credit_history: Some(1.0),
                ..ApplicationRecord::default()
            },
            ApplicationRecord {
                credit_history: Some(0.0),
                ..ApplicationRecord::default()
            },
        ];
        let entries = predict_records(&CreditRule, &records);
        assert_eq!(entries[0].loan_id, "LP9");
        assert_eq!(entries[1].loan_id, "2");
    }

    #[test]
    fn results_are_written_as_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let entries = predict_batch(&CreditRule, &table());
        write_results(&entries, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("loan_id,prediction,probability,confidence,error")
        );
        assert_eq!(lines.count(), 4);
    }

    #[test]
    fn export_names_are_timestamped_csv() {
        let name = default_export_name();
        assert!(name.starts_with("batch_predictions_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "batch_predictions_20240101_120000.csv".len());
    }
}
