//! Leave-one-out dropout filter for small batches.
//!
//! For every TOA the model is refit without it. A TOA whose removal drops the
//! reduced χ² far below the typical leave-one-out value was driving the fit
//! and is rejected. Threshold: `median − mad_multiple × MAD(|χ²_r|)`.
//!
//! Refits run in parallel on independent copies of the TOA set.

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::DropoutFilterPolicy;
use crate::domain::FilterStage;
use crate::error::TimingResult;
use crate::filter::FitContext;
use crate::fit::{FitOutcome, FitStrategy, Fitter};
use crate::math::{mad, median, percentile};
use crate::models::{TimingModel, prefit_residuals};

/// Reduced χ² recorded for a leave-one-out refit that failed.
const FAILED_TRIAL_CHI2R: f64 = 1e64;

/// Whether the newest TOAs keep their protection.
///
/// They lose it when the data set is short (in span or count) and the newest
/// points themselves are separated by a long gap.
fn newest_protected(mjds: &[f64], policy: &DropoutFilterPolicy) -> bool {
    let (Some(first), Some(last)) = (mjds.first(), mjds.last()) else {
        return true;
    };
    let short = last - first < policy.short_span_days || mjds.len() < policy.short_count;
    let start = mjds.len().saturating_sub(policy.protect_newest);
    let gap_among_newest = mjds[start..]
        .windows(2)
        .any(|w| w[1] - w[0] > policy.suspect_gap_days);
    !(short && gap_among_newest)
}

fn leave_one_out(fitter: &dyn Fitter, ctx: &FitContext, model: &TimingModel) -> TimingResult<Vec<f64>> {
    (0..ctx.kept.len())
        .into_par_iter()
        .map(|skip| {
            let subset: Vec<_> = ctx
                .kept
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, t)| t.clone())
                .collect();
            Ok(match fitter.fit(&subset, model, FitStrategy::Direct)? {
                FitOutcome::Converged(result) if result.chi2_reduced.is_finite() => result.chi2_reduced,
                _ => FAILED_TRIAL_CHI2R,
            })
        })
        .collect()
}

pub fn dropout_filter(
    ctx: FitContext,
    model: &TimingModel,
    fitter: &dyn Fitter,
    policy: &DropoutFilterPolicy,
) -> TimingResult<FitContext> {
    let n = ctx.kept.len();
    if n < 3 {
        return Ok(ctx);
    }

    if let FitOutcome::Converged(full) = fitter.fit(&ctx.kept, model, FitStrategy::Direct)? {
        if full.chi2_reduced < 1.0 {
            debug!(chi2_reduced = full.chi2_reduced, "full fit already good, skipping dropout filter");
            return Ok(ctx);
        }
    }

    let chi2rs = leave_one_out(fitter, &ctx, model)?;
    if chi2rs.windows(2).all(|w| w[0] == w[1]) {
        warn!("all leave-one-out fits agree, nothing to filter");
        return Ok(ctx);
    }

    let abs: Vec<f64> = chi2rs.iter().map(|c| c.abs()).collect();
    let (Some(center), Some(spread)) = (median(&chi2rs), mad(&abs)) else {
        return Ok(ctx);
    };
    let threshold = center - policy.mad_multiple * spread;

    // Protected TOAs neither get rejected nor count against the quota.
    let protected_from = if newest_protected(&ctx.kept_mjds(), policy) {
        n.saturating_sub(policy.protect_newest)
    } else {
        n
    };
    let below = |cut: f64| -> Vec<usize> { (0..protected_from).filter(|&i| chi2rs[i] < cut).collect() };
    let mut bad = below(threshold);

    let cap = policy.max_reject_fraction * n as f64;
    if bad.len() as f64 > cap {
        let quartile = percentile(&chi2rs, policy.max_reject_fraction * 100.0).unwrap_or(threshold);
        warn!(
            would_reject = bad.len(),
            n_toas = n,
            "dropout filter over quota, keeping only the worst quartile"
        );
        bad = below(quartile);
    }

    debug!(
        median_chi2r = center,
        threshold,
        rejected = bad.len(),
        "dropout filter"
    );
    if bad.is_empty() {
        return Ok(ctx);
    }
    let residuals = prefit_residuals(model, &ctx.kept)?;
    Ok(ctx.reject(&bad, FilterStage::Dropout, &residuals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::domain::{Residuals, Toa};
    use crate::fit::{FitResult, PhaseFitter};
    use crate::sim::{SimOptions, simulate_toas};

    fn truth() -> TimingModel {
        TimingModel::parse("PSRJ J1000+1000\nF0 2.0 1\nPEPOCH 59000\nRAJ 1.2\nDECJ 0.4\n").unwrap()
    }

    fn batch(n: usize, offsets: &[(usize, f64)]) -> Vec<Toa> {
        let mjds: Vec<f64> = (0..n).map(|i| 59000.3 + i as f64).collect();
        let mut toas = simulate_toas(&truth(), &mjds, &SimOptions::new(500.0, 33)).unwrap();
        for &(i, offset_us) in offsets {
            toas[i].mjd += offset_us * 1e-6 / 86_400.0;
        }
        toas
    }

    #[test]
    fn single_bad_toa_is_dropped() {
        let toas = batch(20, &[(8, 20_000.0)]);
        let out = dropout_filter(
            FitContext::new(toas),
            &truth(),
            &PhaseFitter::default(),
            &DropoutFilterPolicy::default(),
        )
        .unwrap();
        assert_eq!(out.rejected.len(), 1);
        assert!(out.rejected[0].toa.content_id.starts_with("sim_00008"));
        assert_eq!(out.rejected[0].stage, FilterStage::Dropout);
    }

    #[test]
    fn rejection_is_capped_at_a_quarter() {
        let offsets: Vec<(usize, f64)> = (0..9).map(|i| (i * 2, 15_000.0 * (1.0 + i as f64))).collect();
        let toas = batch(20, &offsets);
        let out = dropout_filter(
            FitContext::new(toas),
            &truth(),
            &PhaseFitter::default(),
            &DropoutFilterPolicy::default(),
        )
        .unwrap();
        assert!(out.rejected.len() <= 5, "rejected {}", out.rejected.len());
    }

    /// Leave-one-out χ²_r is looked up by the id of the TOA left out.
    struct TableFitter {
        by_missing: HashMap<String, f64>,
        full: f64,
    }

    impl Fitter for TableFitter {
        fn fit(&self, toas: &[Toa], model: &TimingModel, _: FitStrategy) -> TimingResult<FitOutcome> {
            let chi2_reduced = self
                .by_missing
                .iter()
                .find(|(id, _)| !toas.iter().any(|t| &t.content_id == *id))
                .map_or(self.full, |(_, &c)| c);
            Ok(FitOutcome::Converged(FitResult {
                model: model.clone(),
                free_params: model.free_params()?,
                mjds: toas.iter().map(|t| t.mjd).collect(),
                residuals: Residuals::default(),
                chi2: chi2_reduced,
                chi2_reduced,
                dof: 1,
                iterations: 1,
            }))
        }
    }

    #[test]
    fn protected_toas_do_not_count_against_the_quota() {
        let mut toas = batch(20, &[]);
        for (i, toa) in toas.iter_mut().enumerate() {
            toa.content_id = format!("t{i:02}");
        }
        let low = [(0, 1.0), (1, 1.1), (2, 1.2), (3, 1.3), (17, 0.5), (18, 0.6)];
        let by_missing = (0..20)
            .map(|i| {
                let c = low.iter().find(|(j, _)| *j == i).map_or(10.0 + 0.01 * i as f64, |&(_, c)| c);
                (format!("t{i:02}"), c)
            })
            .collect();
        let fitter = TableFitter { by_missing, full: 10.0 };

        // Six fall below the cut, two of them among the newest three.
        let out = dropout_filter(FitContext::new(toas), &truth(), &fitter, &DropoutFilterPolicy::default()).unwrap();
        let mut rejected: Vec<&str> = out.rejected.iter().map(|r| r.toa.content_id.as_str()).collect();
        rejected.sort_unstable();
        assert_eq!(rejected, ["t00", "t01", "t02", "t03"]);
    }

    #[test]
    fn newest_three_survive_extreme_residuals() {
        let toas = batch(20, &[(17, 30_000.0), (18, -30_000.0), (19, 30_000.0)]);
        let out = dropout_filter(
            FitContext::new(toas),
            &truth(),
            &PhaseFitter::default(),
            &DropoutFilterPolicy::default(),
        )
        .unwrap();
        for prefix in ["sim_00017", "sim_00018", "sim_00019"] {
            assert!(out.kept.iter().any(|t| t.content_id.starts_with(prefix)), "{prefix} rejected");
        }
    }

    #[test]
    fn protection_lifts_for_gappy_short_batches() {
        let policy = DropoutFilterPolicy::default();
        let dense: Vec<f64> = (0..10).map(|i| 59000.0 + i as f64).collect();
        assert!(newest_protected(&dense, &policy));

        let mut gappy = dense.clone();
        gappy.push(59050.0);
        assert!(!newest_protected(&gappy, &policy));

        // Long, well-populated data sets keep the protection even with a gap.
        let mut long: Vec<f64> = (0..40).map(|i| 59000.0 + 2.0 * i as f64).collect();
        long.push(59200.0);
        assert!(newest_protected(&long, &policy));
    }
}
