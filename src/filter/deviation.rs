//! Robust-deviation filter for large batches.
//!
//! Pre-fit residuals further than `n_sigma` effective standard deviations
//! (`1.4826 × MAD`) from their median are rejected, except:
//! - the newest `protect_newest` TOAs
//! - TOAs whose |residual| is below both a fraction of the period and a
//!   multiple of the median TOA error

use tracing::debug;

use crate::config::DeviationFilterPolicy;
use crate::domain::FilterStage;
use crate::error::{TimingError, TimingResult};
use crate::filter::FitContext;
use crate::math::{MAD_TO_SIGMA, mad, median};
use crate::models::{TimingModel, prefit_residuals};

pub fn deviation_filter(
    ctx: FitContext,
    model: &TimingModel,
    policy: &DeviationFilterPolicy,
) -> TimingResult<FitContext> {
    let n = ctx.kept.len();
    if n == 0 {
        return Ok(ctx);
    }
    let period_us = model
        .period()
        .ok_or_else(|| TimingError::Configuration("timing model needs a positive F0".to_string()))?
        * 1e6;

    let residuals = prefit_residuals(model, &ctx.kept)?;
    let errors: Vec<f64> = ctx.kept.iter().map(|t| t.error_us).collect();
    let (Some(center), Some(spread), Some(median_error)) = (median(&residuals), mad(&residuals), median(&errors))
    else {
        return Ok(ctx);
    };
    let threshold = policy.n_sigma * spread * MAD_TO_SIGMA;
    if threshold <= 0.0 {
        return Ok(ctx);
    }

    let protected_from = n.saturating_sub(policy.protect_newest);
    let bad: Vec<usize> = residuals
        .iter()
        .enumerate()
        .filter(|&(i, r)| {
            let deviates = (r - center).abs() > threshold;
            let within_noise = r.abs() < policy.noise_period_fraction * period_us
                && r.abs() < policy.noise_error_multiple * median_error;
            deviates && !within_noise && i < protected_from
        })
        .map(|(i, _)| i)
        .collect();

    debug!(
        median_us = center,
        threshold_us = threshold,
        rejected = bad.len(),
        "robust-deviation filter"
    );
    Ok(ctx.reject(&bad, FilterStage::Deviation, &residuals))
}
