//! Weighted least squares solver.
//!
//! Every timing fit linearises the phase model around the current parameters and
//! solves
//!
//! ```text
//! minimize Σ w_i (y_i - x_i^T δ)^2
//! ```
//!
//! for the parameter step δ. Callers scale rows by `sqrt(w_i)` and normalise
//! columns before calling in here; spin-derivative columns otherwise span dozens
//! of orders of magnitude.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Diagonal of `(XᵀX)⁻¹`, i.e. parameter variances for a row-weighted design.
///
/// Singular directions (σ below `1e-12 × σ_max`) are dropped, which makes the
/// corresponding variances infinite-free but optimistic. Returns `None` when
/// the decomposition yields nothing finite.
pub fn covariance_diagonal(x: &DMatrix<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(false, true);
    let v_t = svd.v_t?;
    let s_max = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    if s_max <= 0.0 {
        return None;
    }

    let cols = x.ncols();
    let mut diag = DVector::<f64>::zeros(cols);
    for (k, &s) in svd.singular_values.iter().enumerate() {
        if s <= 1e-12 * s_max {
            continue;
        }
        for j in 0..cols {
            let v = v_t[(k, j)];
            diag[j] += v * v / (s * s);
        }
    }

    diag.iter().all(|v| v.is_finite()).then_some(diag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn covariance_of_mean_estimate() {
        // Four unit-weight observations of a constant: var(mean) = 1/4.
        let x = DMatrix::from_element(4, 1, 1.0);
        let diag = covariance_diagonal(&x).unwrap();
        assert!((diag[0] - 0.25).abs() < 1e-12);
    }
}
