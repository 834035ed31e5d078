//! Reporting utilities: fit summaries, residual rankings, terminal output.

pub mod format;

pub use format::*;

use crate::domain::TimingSolution;
use crate::fit::FitResult;

/// One-line summary stored with each solution.
pub fn fit_summary(result: &FitResult) -> String {
    let rms = weighted_rms(&result.residuals.val, &result.residuals.err);
    let params: Vec<String> = result
        .free_params
        .iter()
        .map(|p| {
            let name = p.as_str();
            let value = result.model.get(name).unwrap_or(f64::NAN);
            match result.model.param(name).and_then(|p| p.uncertainty) {
                Some(sigma) => format!("{name}={value:.12e}±{sigma:.2e}"),
                None => format!("{name}={value:.12e}"),
            }
        })
        .collect();
    format!(
        "ntoa={} chi2={:.3} dof={} chi2r={:.3} wrms={:.3}us iter={} {}",
        result.n_toas(),
        result.chi2,
        result.dof,
        result.chi2_reduced,
        rms,
        result.iterations,
        params.join(" ")
    )
}

/// Error-weighted RMS of residuals (µs).
pub fn weighted_rms(values: &[f64], errors: &[f64]) -> f64 {
    let (mut sum, mut weight) = (0.0, 0.0);
    for (v, e) in values.iter().zip(errors) {
        if *e > 0.0 {
            let w = 1.0 / (e * e);
            sum += w * v * v;
            weight += w;
        }
    }
    if weight > 0.0 { (sum / weight).sqrt() } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedResidual {
    pub mjd: f64,
    pub residual_us: f64,
    pub error_us: f64,
    /// |residual| / error.
    pub significance: f64,
}

/// The `top_n` fitted TOAs with the largest |residual| / error.
pub fn rank_residuals(solution: &TimingSolution, top_n: usize) -> Vec<RankedResidual> {
    let mjds = &solution.notes.fitted_mjds;
    let mut ranked: Vec<RankedResidual> = solution
        .residuals
        .val
        .iter()
        .zip(&solution.residuals.err)
        .zip(mjds)
        .map(|((&residual_us, &error_us), &mjd)| RankedResidual {
            mjd,
            residual_us,
            error_us,
            significance: if error_us > 0.0 { residual_us.abs() / error_us } else { 0.0 },
        })
        .collect();
    ranked.sort_by(|a, b| b.significance.total_cmp(&a.significance));
    ranked.truncate(top_n);
    ranked
}
