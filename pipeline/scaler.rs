use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Columns whose standard deviation falls below this are left unscaled.
const ZERO_SCALE_TOLERANCE: f64 = 10.0 * f64::EPSILON;

#[derive(Error, Debug, PartialEq)]
pub enum ScalerError {
    #[error("The scaler has not been fitted.")]
    NotFitted,
    #[error("Cannot fit the scaler on an empty matrix.")]
    EmptyInput,
    #[error("Input has {found} columns, but the scaler was fitted on {expected}.")]
    ColumnMismatch { found: usize, expected: usize },
}

/// Per-column mean and standard deviation learned from training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingState {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

/// Standardizes columns to zero mean and unit variance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    state: Option<ScalingState>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&ScalingState> {
        self.state.as_ref()
    }

    /// Learns column means and population standard deviations.
    pub fn fit(&mut self, x: ArrayView2<f64>) -> Result<(), ScalerError> {
        let mean = x.mean_axis(Axis(0)).ok_or(ScalerError::EmptyInput)?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std < ZERO_SCALE_TOLERANCE { 1.0 } else { std });
        self.state = Some(ScalingState { mean, scale });
        Ok(())
    }

    /// Applies `(x - mean) / std` column by column.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ScalerError> {
        let state = self.checked_state(x.ncols())?;
        Ok((&x - &state.mean) / &state.scale)
    }

    pub fn transform_row(&self, row: ArrayView1<f64>) -> Result<Array1<f64>, ScalerError> {
        let state = self.checked_state(row.len())?;
        Ok((&row - &state.mean) / &state.scale)
    }

    fn checked_state(&self, ncols: usize) -> Result<&ScalingState, ScalerError> {
        let state = self.state.as_ref().ok_or(ScalerError::NotFitted)?;
        if ncols != state.mean.len() {
            return Err(ScalerError::ColumnMismatch {
                found: ncols,
                expected: state.mean.len(),
            });
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn fitted_columns_have_zero_mean_and_unit_variance() {
        let x = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]];
        let mut scaler = StandardScaler::new();
        scaler.fit(x.view()).unwrap();
        let scaled = scaler.transform(x.view()).unwrap();

        for column in scaled.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(column.mean().unwrap(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(column.std(0.0), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_columns_are_centered_but_not_scaled() {
        let x = array![[5.0, 1.0], [5.0, 2.0]];
        let mut scaler = StandardScaler::new();
        scaler.fit(x.view()).unwrap();
        let state = scaler.state().unwrap();
        assert_eq!(state.scale[0], 1.0);
        let scaled = scaler.transform(x.view()).unwrap();
        assert_eq!(scaled.column(0).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn transform_before_fit_is_an_error() {
        let scaler = StandardScaler::new();
        assert_eq!(
            scaler.transform(array![[1.0]].view()),
            Err(ScalerError::NotFitted)
        );
    }

    #[test]
    fn column_count_must_match_fit() {
        let mut scaler = StandardScaler::new();
        scaler.fit(array![[1.0, 2.0], [3.0, 4.0]].view()).unwrap();
        assert_eq!(
            scaler.transform_row(array![1.0, 2.0, 3.0].view()),
            Err(ScalerError::ColumnMismatch {
                found: 3,
                expected: 2
            })
        );
    }

    #[test]
    fn empty_matrix_cannot_be_fitted() {
        let mut scaler = StandardScaler::new();
        let empty = Array2::<f64>::zeros((0, 3));
        assert_eq!(scaler.fit(empty.view()), Err(ScalerError::EmptyInput));
        assert!(!scaler.is_fitted());
    }
}
