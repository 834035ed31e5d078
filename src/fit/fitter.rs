//! Weighted least-squares timing fits.
//!
//! Given:
//! - TOAs `t_i` with uncertainties `σ_i`
//! - a timing model with some parameters flagged free
//!
//! we fix the pulse number `N_i` of every TOA from the starting model and
//! iterate Gauss–Newton steps on
//!
//! ```text
//! minimize Σ w_i (φ(t_i; p) − N_i + c)^2,   w_i = 1 / (σ_i ν_i)^2
//! ```
//!
//! where `c` is a free phase offset that is never written to the model.
//! A failed fit is a value (`FitOutcome::Failed`), not an error: the engine
//! routes it to the fallback path.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::domain::{FitStrategyKind, Residuals, Toa};
use crate::error::TimingResult;
use crate::fit::mcmc::{McmcOptions, fit_mcmc};
use crate::math::{covariance_diagonal, solve_least_squares};
use crate::models::phase::phase_weights;
use crate::models::{FitParam, PhaseModel, TimingModel, assign_pulse_numbers, evaluate};

/// Largest RA/DEC change accepted in one iteration (radians, 0.5°).
const MAX_POSITION_STEP: f64 = 0.5 * std::f64::consts::PI / 180.0;

/// Step-halving attempts before an iteration is declared stalled.
const MAX_STEP_HALVINGS: usize = 8;

/// Which fitting routine to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    Direct,
    Mcmc,
}

impl FitStrategy {
    pub fn resolve(kind: FitStrategyKind, n_free: usize) -> Self {
        match kind {
            FitStrategyKind::Direct => FitStrategy::Direct,
            FitStrategyKind::Mcmc => FitStrategy::Mcmc,
            FitStrategyKind::Auto if n_free > 2 => FitStrategy::Mcmc,
            FitStrategyKind::Auto => FitStrategy::Direct,
        }
    }
}

/// A converged fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Input model with fitted values and uncertainties written back.
    pub model: TimingModel,
    pub free_params: Vec<FitParam>,
    pub mjds: Vec<f64>,
    pub residuals: Residuals,
    pub chi2: f64,
    pub chi2_reduced: f64,
    /// `n − n_free − 1` (phase offset), floored at zero.
    pub dof: usize,
    pub iterations: usize,
}

impl FitResult {
    pub fn n_toas(&self) -> usize {
        self.mjds.len()
    }
}

#[derive(Debug, Clone)]
pub enum FitOutcome {
    Converged(FitResult),
    Failed { reason: String },
}

impl FitOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        FitOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn result(&self) -> Option<&FitResult> {
        match self {
            FitOutcome::Converged(result) => Some(result),
            FitOutcome::Failed { .. } => None,
        }
    }

    pub fn into_result(self) -> Option<FitResult> {
        match self {
            FitOutcome::Converged(result) => Some(result),
            FitOutcome::Failed { .. } => None,
        }
    }

    pub fn chi2_reduced(&self) -> Option<f64> {
        self.result().map(|r| r.chi2_reduced)
    }
}

/// Fits `model`'s free parameters to `toas`.
///
/// Implementations are shared across rayon workers (leave-one-out trials,
/// F-test subsets), hence `Sync`.
pub trait Fitter: Send + Sync {
    fn fit(&self, toas: &[Toa], model: &TimingModel, strategy: FitStrategy) -> TimingResult<FitOutcome>;
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub max_iterations: usize,
    pub mcmc: McmcOptions,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            mcmc: McmcOptions::default(),
        }
    }
}

/// The production fitter: Gauss–Newton WLS, optionally followed by a sampler.
#[derive(Debug, Clone, Default)]
pub struct PhaseFitter {
    pub options: FitOptions,
}

impl PhaseFitter {
    pub fn new(options: FitOptions) -> Self {
        Self { options }
    }
}

impl Fitter for PhaseFitter {
    fn fit(&self, toas: &[Toa], model: &TimingModel, strategy: FitStrategy) -> TimingResult<FitOutcome> {
        match strategy {
            FitStrategy::Direct => fit_wls(toas, model, self.options.max_iterations),
            FitStrategy::Mcmc => fit_mcmc(toas, model, &self.options.mcmc, self.options.max_iterations),
        }
    }
}

pub fn reduced_chi2(chi2: f64, dof: usize) -> f64 {
    if dof > 0 { chi2 / dof as f64 } else { chi2 }
}

/// Package an evaluated phase model as a [`FitResult`].
pub(crate) fn build_result(
    toas: &[Toa],
    model: &TimingModel,
    phase: &PhaseModel,
    pulse_numbers: &[f64],
    free: &[FitParam],
    uncertainties: Option<&[f64]>,
    iterations: usize,
) -> FitResult {
    let eval = evaluate(phase, toas, pulse_numbers);
    let mut fitted = model.clone();
    phase.write_params(&mut fitted, free);
    if let Some(sigmas) = uncertainties {
        for (param, sigma) in free.iter().zip(sigmas) {
            fitted.set_uncertainty(param.as_str(), Some(*sigma));
        }
    }
    let dof = toas.len().saturating_sub(free.len() + 1);
    FitResult {
        model: fitted,
        free_params: free.to_vec(),
        mjds: toas.iter().map(|t| t.mjd).collect(),
        residuals: Residuals {
            val: eval.residuals_us,
            err: eval.errors_us,
        },
        chi2: eval.chi2,
        chi2_reduced: reduced_chi2(eval.chi2, dof),
        dof,
        iterations,
    }
}

/// Residuals and χ² of `model` on `toas` without adjusting anything.
pub fn evaluate_model(toas: &[Toa], model: &TimingModel) -> TimingResult<FitResult> {
    let phase = PhaseModel::from_model(model)?;
    let numbers = assign_pulse_numbers(&phase, toas);
    let free = model.free_params()?;
    Ok(build_result(toas, model, &phase, &numbers, &free, None, 0))
}

/// Row-weighted linearised system with normalised columns.
///
/// The last column is the phase offset. Returns the matrix, the right-hand
/// side and the column norms used for normalisation.
fn linear_system(
    phase: &PhaseModel,
    toas: &[Toa],
    pulse_numbers: &[f64],
    free: &[FitParam],
) -> (DMatrix<f64>, DVector<f64>, Vec<f64>) {
    let n = toas.len();
    let cols = free.len() + 1;
    let weights = phase_weights(phase, toas);
    let mut x = DMatrix::<f64>::zeros(n, cols);
    let mut y = DVector::<f64>::zeros(n);
    let mut row = vec![0.0; free.len()];

    for (i, toa) in toas.iter().enumerate() {
        let sw = weights[i].sqrt();
        let mjd = phase.arrival_mjd(toa);
        phase.fill_design_row(mjd, free, &mut row);
        for (j, v) in row.iter().enumerate() {
            x[(i, j)] = sw * v;
        }
        x[(i, cols - 1)] = sw;
        y[i] = -sw * (phase.phase(mjd) - pulse_numbers[i]);
    }

    let mut norms = vec![1.0; cols];
    for (j, norm) in norms.iter_mut().enumerate() {
        let col_norm = x.column(j).norm();
        if col_norm > 0.0 && col_norm.is_finite() {
            *norm = col_norm;
            x.column_mut(j).scale_mut(1.0 / col_norm);
        }
    }
    (x, y, norms)
}

/// Gauss–Newton WLS fit of the free parameters of `model`.
pub fn fit_wls(toas: &[Toa], model: &TimingModel, max_iterations: usize) -> TimingResult<FitOutcome> {
    if toas.len() < 2 {
        return Ok(FitOutcome::failed(format!(
            "need at least 2 TOAs to fit, got {}",
            toas.len()
        )));
    }
    let free = model.free_params()?;
    if free.is_empty() {
        return Ok(FitOutcome::failed("no free parameters"));
    }

    let mut phase = PhaseModel::from_model(model)?;
    let numbers = assign_pulse_numbers(&phase, toas);
    let mut chi2 = evaluate(&phase, toas, &numbers).chi2;
    if !chi2.is_finite() {
        return Ok(FitOutcome::failed("non-finite pre-fit residuals"));
    }

    let mut iterations = 0;
    for iter in 1..=max_iterations {
        iterations = iter;
        let (x, y, norms) = linear_system(&phase, toas, &numbers, &free);
        let Some(solution) = solve_least_squares(&x, &y) else {
            return Ok(FitOutcome::failed("singular design matrix"));
        };

        let mut step: Vec<f64> = free.iter().enumerate().map(|(j, _)| solution[j] / norms[j]).collect();
        for (delta, param) in step.iter_mut().zip(&free) {
            if matches!(param, FitParam::RaJ | FitParam::DecJ) {
                *delta = delta.clamp(-MAX_POSITION_STEP, MAX_POSITION_STEP);
            }
        }

        let mut lambda = 1.0;
        let mut accepted = None;
        for _ in 0..=MAX_STEP_HALVINGS {
            let mut trial = phase.clone();
            for (param, delta) in free.iter().zip(&step) {
                trial.set(*param, phase.get(*param) + lambda * delta);
            }
            let trial_chi2 = evaluate(&trial, toas, &numbers).chi2;
            if trial_chi2.is_finite() && trial_chi2 <= chi2 {
                accepted = Some((trial, trial_chi2));
                break;
            }
            lambda *= 0.5;
        }

        let Some((trial, trial_chi2)) = accepted else {
            debug!(iter, chi2, "no downhill step, stopping");
            break;
        };
        let improvement = chi2 - trial_chi2;
        phase = trial;
        chi2 = trial_chi2;
        if improvement <= 1e-8 * chi2.max(1.0) {
            break;
        }
        if iter == max_iterations {
            warn!(iter, chi2, "fit reached the iteration limit before settling");
        }
    }

    let (x, _, norms) = linear_system(&phase, toas, &numbers, &free);
    let uncertainties: Option<Vec<f64>> = covariance_diagonal(&x)
        .map(|diag| (0..free.len()).map(|j| diag[j].sqrt() / norms[j]).collect());

    let result = build_result(toas, model, &phase, &numbers, &free, uncertainties.as_deref(), iterations);
    if !(result.chi2.is_finite() && result.residuals.val.iter().all(|r| r.is_finite())) {
        return Ok(FitOutcome::failed("fit produced non-finite residuals"));
    }
    debug!(
        n_toas = result.n_toas(),
        n_free = free.len(),
        chi2 = result.chi2,
        chi2_reduced = result.chi2_reduced,
        iterations,
        "wls fit converged"
    );
    Ok(FitOutcome::Converged(result))
}
