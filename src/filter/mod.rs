//! Outlier filter pipeline.
//!
//! Each stage takes a [`FitContext`] and returns a new one with some TOAs
//! moved from `kept` to `rejected`. Order:
//!
//! 1. error filter (always)
//! 2. robust-deviation filter for large batches with many free parameters,
//!    otherwise the leave-one-out dropout filter
//!
//! Batches below `policy.min_toas_to_filter` pass through untouched.

use tracing::{debug, info};

use crate::config::Policy;
use crate::domain::{FilterDecision, FilterStage, Toa};
use crate::error::TimingResult;
use crate::fit::Fitter;
use crate::models::TimingModel;

pub mod deviation;
pub mod dropout;
pub mod uncertainty;

pub use deviation::deviation_filter;
pub use dropout::dropout_filter;
pub use uncertainty::error_filter;

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedToa {
    pub toa: Toa,
    pub stage: FilterStage,
    /// Pre-fit residual (µs) when the TOA was rejected.
    pub residual_us: f64,
}

/// TOAs flowing through the filter stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitContext {
    /// Chronological.
    pub kept: Vec<Toa>,
    pub rejected: Vec<RejectedToa>,
}

impl FitContext {
    pub fn new(mut toas: Vec<Toa>) -> Self {
        toas.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
        Self {
            kept: toas,
            rejected: Vec::new(),
        }
    }

    /// Move `kept[i]` for every `i` in `bad` to `rejected`.
    ///
    /// `residuals_us` is aligned with `kept`.
    pub fn reject(self, bad: &[usize], stage: FilterStage, residuals_us: &[f64]) -> Self {
        if bad.is_empty() {
            return self;
        }
        let mut kept = Vec::with_capacity(self.kept.len() - bad.len());
        let mut rejected = self.rejected;
        for (i, toa) in self.kept.into_iter().enumerate() {
            if bad.contains(&i) {
                rejected.push(RejectedToa {
                    toa,
                    stage,
                    residual_us: residuals_us.get(i).copied().unwrap_or(0.0),
                });
            } else {
                kept.push(toa);
            }
        }
        Self { kept, rejected }
    }

    pub fn kept_mjds(&self) -> Vec<f64> {
        self.kept.iter().map(|t| t.mjd).collect()
    }

    /// Per-TOA verdicts, kept first then rejected in rejection order.
    pub fn decisions(&self) -> Vec<(String, FilterDecision)> {
        self.kept
            .iter()
            .map(|t| (t.content_id.clone(), FilterDecision::Kept))
            .chain(self.rejected.iter().map(|r| {
                (
                    r.toa.content_id.clone(),
                    FilterDecision::Rejected {
                        stage: r.stage,
                        residual_us: r.residual_us,
                    },
                )
            }))
            .collect()
    }
}

/// Run the stage sequence on `ctx` for a model whose free flags are final
/// for the mandatory set.
pub fn run_filters(
    ctx: FitContext,
    model: &TimingModel,
    fitter: &dyn Fitter,
    policy: &Policy,
) -> TimingResult<FitContext> {
    if ctx.kept.len() < policy.min_toas_to_filter {
        debug!(n_toas = ctx.kept.len(), "too few TOAs to filter");
        return Ok(ctx);
    }
    let before = ctx.kept.len();

    let ctx = error_filter(ctx, model, &policy.error_filter)?;

    let n_free = model.free_params()?.len();
    let dev = &policy.deviation_filter;
    let ctx = if ctx.kept.len() > dev.min_toas && n_free >= dev.min_free_params {
        deviation_filter(ctx, model, dev)?
    } else {
        dropout_filter(ctx, model, fitter, &policy.dropout_filter)?
    };

    info!(
        before,
        kept = ctx.kept.len(),
        rejected = ctx.rejected.len(),
        "filter pipeline finished"
    );
    Ok(ctx)
}
