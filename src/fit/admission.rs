//! Which parameters a cycle fits.
//!
//! Two steps:
//! 1. `parameter_set`: mandatory parameters (previously free, plus the
//!    always-fit set) and candidates (unlocked by the data span).
//! 2. `admit_candidates`: every non-empty candidate subset is fit alongside the
//!    mandatory set and compared to the mandatory-only fit with an F-test on
//!    the weighted χ². The subset with the lowest passing p-value is admitted.
//!
//! Guardrails: nothing is admitted when the newest TOAs are separated by long
//! gaps, since a new parameter would just soak up the unconstrained stretch.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::AdmissionPolicy;
use crate::domain::{ParameterSet, Toa, TimingSolution};
use crate::error::TimingResult;
use crate::fit::fitter::{FitOutcome, FitStrategy, Fitter};
use crate::math::f_test;
use crate::models::{FitParam, TimingModel};

/// Sort names into `FitParam::ALL` order, dropping duplicates.
fn canonical(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort_by_key(|name| {
        FitParam::ALL
            .iter()
            .position(|p| p.as_str() == name)
            .unwrap_or(usize::MAX)
    });
    names.dedup();
    names
}

/// Mandatory and candidate parameters for the next cycle.
///
/// Without a previous solution only the always-fit set is free and nothing
/// is a candidate.
pub fn parameter_set(
    policy: &AdmissionPolicy,
    configured: &[String],
    previous: Option<&TimingSolution>,
    span_days: f64,
) -> ParameterSet {
    let always = policy
        .always_fit
        .iter()
        .filter(|name| configured.contains(name))
        .cloned();

    let Some(previous) = previous else {
        return ParameterSet {
            mandatory: canonical(always),
            candidates: Vec::new(),
        };
    };

    let mandatory = canonical(previous.unfrozen_params.iter().cloned().chain(always));
    let candidates = policy
        .rules
        .iter()
        .filter(|rule| configured.contains(&rule.name))
        .filter(|rule| !mandatory.contains(&rule.name))
        .filter(|rule| span_days >= rule.min_span_days)
        .filter(|rule| rule.requires.iter().all(|req| mandatory.contains(req)))
        .map(|rule| rule.name.clone())
        .collect();

    ParameterSet {
        mandatory,
        candidates,
    }
}

/// Reason to skip admission when the newest TOAs are too sparse.
pub fn gap_guard(policy: &AdmissionPolicy, toas: &[Toa]) -> Option<String> {
    let mut mjds: Vec<f64> = toas.iter().map(|t| t.mjd).collect();
    mjds.sort_by(f64::total_cmp);

    policy.gap_guards.iter().find_map(|guard| {
        let start = mjds.len().saturating_sub(guard.latest_n);
        let widest = mjds[start..]
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(0.0_f64, f64::max);
        (widest > guard.max_gap_days).then(|| {
            format!(
                "gap of {widest:.1} d among the latest {} TOAs exceeds {} d",
                guard.latest_n, guard.max_gap_days
            )
        })
    })
}

/// All non-empty subsets, smallest first, each in candidate order.
fn subsets(candidates: &[String]) -> Vec<Vec<String>> {
    let n = candidates.len();
    let mut out: Vec<Vec<String>> = (1u32..(1u32 << n))
        .map(|mask| {
            candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, c)| c.clone())
                .collect()
        })
        .collect();
    out.sort_by_key(|s: &Vec<String>| s.len());
    out
}

#[derive(Debug, Clone)]
pub struct SubsetTrial {
    pub params: Vec<String>,
    pub chi2: f64,
    pub dof: usize,
    pub f_stat: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub admitted: Vec<String>,
    pub p_value: Option<f64>,
    pub reference_chi2: Option<f64>,
    pub trials: Vec<SubsetTrial>,
    /// Why admission was not attempted.
    pub skipped: Option<String>,
}

impl Admission {
    fn skipped(reason: String) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// F-test every candidate subset against the mandatory-only fit.
///
/// `model` must already have exactly the mandatory parameters free.
pub fn admit_candidates(
    fitter: &dyn Fitter,
    toas: &[Toa],
    model: &TimingModel,
    candidates: &[String],
    policy: &AdmissionPolicy,
) -> TimingResult<Admission> {
    if candidates.is_empty() {
        return Ok(Admission::default());
    }
    if let Some(reason) = gap_guard(policy, toas) {
        info!(%reason, "skipping parameter admission");
        return Ok(Admission::skipped(reason));
    }

    let reference = match fitter.fit(toas, model, FitStrategy::Direct)? {
        FitOutcome::Converged(result) => result,
        FitOutcome::Failed { reason } => {
            return Ok(Admission::skipped(format!("reference fit failed: {reason}")));
        }
    };

    let trials: Vec<Option<SubsetTrial>> = subsets(candidates)
        .into_par_iter()
        .map(|params| -> TimingResult<Option<SubsetTrial>> {
            let mut augmented = model.clone();
            for name in &params {
                augmented.set_free(name.parse::<FitParam>()?, true);
            }
            let result = match fitter.fit(toas, &augmented, FitStrategy::Direct)? {
                FitOutcome::Converged(result) => result,
                FitOutcome::Failed { reason } => {
                    debug!(params = ?params, %reason, "subset fit failed");
                    return Ok(None);
                }
            };
            let test = f_test(reference.chi2, reference.dof as f64, result.chi2, result.dof as f64);
            Ok(Some(SubsetTrial {
                params,
                chi2: result.chi2,
                dof: result.dof,
                f_stat: test.f_stat,
                p_value: test.p_value,
            }))
        })
        .collect::<TimingResult<_>>()?;
    let trials: Vec<SubsetTrial> = trials.into_iter().flatten().collect();

    // Deterministic selection: lowest p, ties to the earlier (smaller) subset.
    let best = trials
        .iter()
        .enumerate()
        .filter(|(_, t)| t.p_value < policy.p_value_threshold)
        .min_by(|(ia, a), (ib, b)| a.p_value.total_cmp(&b.p_value).then(ia.cmp(ib)))
        .map(|(_, t)| t.clone());

    if let Some(best) = &best {
        info!(params = ?best.params, p_value = best.p_value, "admitting parameters");
    }
    Ok(Admission {
        admitted: best.as_ref().map(|b| b.params.clone()).unwrap_or_default(),
        p_value: best.map(|b| b.p_value),
        reference_chi2: Some(reference.chi2),
        trials,
        skipped: None,
    })
}
