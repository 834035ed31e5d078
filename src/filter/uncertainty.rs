//! Error-magnitude filter.
//!
//! Rejects TOAs whose quoted uncertainty exceeds `max(fraction × P, floor)`.
//! When that would reject more than the allowed share of the batch, the
//! fraction is raised step by step until it no longer does.

use tracing::{debug, warn};

use crate::config::ErrorFilterPolicy;
use crate::domain::FilterStage;
use crate::error::{TimingError, TimingResult};
use crate::filter::FitContext;
use crate::models::{TimingModel, prefit_residuals};

/// Final threshold (µs) and the indices above it.
///
/// The relaxed fraction is the first step of `period_fraction + k × relax_step`
/// that lifts the threshold to the error that must survive, found directly
/// rather than by stepping.
fn relaxed_cut(errors_us: &[f64], period_us: f64, policy: &ErrorFilterPolicy) -> (f64, Vec<usize>) {
    let threshold_at = |steps: f64| (policy.period_fraction + steps * policy.relax_step) * period_us;
    let above = |threshold: f64| -> Vec<usize> {
        errors_us
            .iter()
            .enumerate()
            .filter(|(_, e)| **e > threshold)
            .map(|(i, _)| i)
            .collect()
    };

    let initial = threshold_at(0.0).max(policy.floor_us);
    let bad = above(initial);
    let allowed = (policy.max_reject_fraction * errors_us.len() as f64).floor() as usize;
    if bad.len() <= allowed || policy.relax_step <= 0.0 || period_us <= 0.0 {
        return (initial, bad);
    }

    // `allowed < bad.len()`, so the index exists.
    let mut sorted = errors_us.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let keep_at_least = sorted[allowed];

    let mut steps = ((keep_at_least / period_us - policy.period_fraction) / policy.relax_step)
        .ceil()
        .max(1.0);
    // Rounding can leave the cut a hair short.
    while threshold_at(steps).max(policy.floor_us) < keep_at_least {
        steps += 1.0;
    }
    let threshold = threshold_at(steps).max(policy.floor_us);
    let relaxed = above(threshold);
    warn!(
        initial_us = initial,
        threshold_us = threshold,
        would_reject = bad.len(),
        rejected = relaxed.len(),
        n_toas = errors_us.len(),
        "error filter would reject too many TOAs, relaxed the threshold"
    );
    (threshold, relaxed)
}

pub fn error_filter(ctx: FitContext, model: &TimingModel, policy: &ErrorFilterPolicy) -> TimingResult<FitContext> {
    if ctx.kept.is_empty() {
        return Ok(ctx);
    }
    let period_us = model
        .period()
        .ok_or_else(|| TimingError::Configuration("timing model needs a positive F0".to_string()))?
        * 1e6;

    let errors: Vec<f64> = ctx.kept.iter().map(|t| t.error_us).collect();
    let (threshold, bad) = relaxed_cut(&errors, period_us, policy);
    debug!(threshold_us = threshold, rejected = bad.len(), "error filter");
    if bad.is_empty() {
        return Ok(ctx);
    }
    let residuals = prefit_residuals(model, &ctx.kept)?;
    Ok(ctx.reject(&bad, FilterStage::Error, &residuals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Toa, ToaNotes};

    fn model() -> TimingModel {
        // P = 0.5 s: 1% is 5 ms, below the 15 ms floor.
        TimingModel::parse("PSRJ X\nF0 2.0 1\nPEPOCH 59000\n").unwrap()
    }

    fn toa(i: usize, error_us: f64) -> Toa {
        Toa {
            content_id: format!("obs_{i}"),
            frequency: 600.0,
            mjd: 59000.0 + i as f64,
            error_us,
            telescope: "chime".into(),
            raw_line: String::new(),
            notes: ToaNotes::default(),
        }
    }

    #[test]
    fn rejects_errors_above_floor() {
        let toas: Vec<Toa> = (0..20)
            .map(|i| toa(i, if i == 4 { 50_000.0 } else { 1_000.0 }))
            .collect();
        let out = error_filter(FitContext::new(toas), &model(), &ErrorFilterPolicy::default()).unwrap();
        assert_eq!(out.kept.len(), 19);
        assert_eq!(out.rejected[0].toa.content_id, "obs_4");
        assert_eq!(out.rejected[0].stage, FilterStage::Error);
    }

    #[test]
    fn relaxes_when_errors_are_systematically_large() {
        // 30% at 20 ms: the 15 ms floor would cut 30%, so the threshold rises
        // to 6% of 0.5 s = 30 ms and nothing is cut.
        let toas: Vec<Toa> = (0..20)
            .map(|i| toa(i, if i % 10 < 3 { 20_000.0 } else { 1_000.0 }))
            .collect();
        let out = error_filter(FitContext::new(toas), &model(), &ErrorFilterPolicy::default()).unwrap();
        assert_eq!(out.kept.len(), 20);
    }

    #[test]
    fn never_rejects_more_than_quota() {
        let errors: Vec<f64> = (0..50).map(|i| 10_000.0 + 1_000.0 * i as f64).collect();
        let policy = ErrorFilterPolicy::default();
        let (threshold, bad) = relaxed_cut(&errors, 500_000.0, &policy);
        assert!(bad.len() as f64 <= 0.10 * 50.0);
        assert!(bad.iter().all(|&i| errors[i] > threshold));
    }

    #[test]
    fn huge_errors_relax_in_one_jump() {
        let errors: Vec<f64> = (0..20).map(|i| if i < 3 { 1e12 } else { 1_000.0 }).collect();
        let policy = ErrorFilterPolicy::default();
        let (threshold, bad) = relaxed_cut(&errors, 500_000.0, &policy);
        assert!(bad.is_empty());
        assert!(threshold >= 1e12);
        // Still on the step grid: 0.01 + k × 0.05 of the period.
        let steps = (threshold / 500_000.0 - 0.01) / 0.05;
        assert!((steps - steps.round()).abs() < 1e-6, "{steps}");
    }
}
