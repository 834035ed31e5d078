//! Cluster-folding fallback fit.
//!
//! When a direct fit fails or ends with a large reduced χ², the TOAs are split
//! into clusters at unusually long gaps. Clusters are folded in largest first,
//! refitting after each one, so the model is phase-connected on dense data
//! before it has to bridge a gap.

use tracing::{debug, info};

use crate::domain::Toa;
use crate::error::TimingResult;
use crate::fit::fitter::{FitOutcome, FitResult, FitStrategy, Fitter, evaluate_model};
use crate::math::{mad, median};
use crate::models::TimingModel;

/// Split threshold (days): `median + multiple × MAD` of consecutive TOA gaps.
///
/// `None` with fewer than two TOAs.
pub fn gap_threshold(mjds_sorted: &[f64], mad_multiple: f64) -> Option<f64> {
    let gaps: Vec<f64> = mjds_sorted.windows(2).map(|w| w[1] - w[0]).collect();
    let center = median(&gaps)?;
    let spread = mad(&gaps)?;
    Some(center + mad_multiple * spread)
}

/// Group TOA indices into clusters, largest first.
///
/// `toas` need not be sorted; the returned indices refer to the input slice.
/// Equal-sized clusters keep chronological order.
pub fn clusters(toas: &[Toa], mad_multiple: f64) -> Vec<Vec<usize>> {
    if toas.is_empty() {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..toas.len()).collect();
    order.sort_by(|&a, &b| toas[a].mjd.total_cmp(&toas[b].mjd));
    let mjds: Vec<f64> = order.iter().map(|&i| toas[i].mjd).collect();

    let Some(threshold) = gap_threshold(&mjds, mad_multiple) else {
        return vec![order];
    };

    let mut groups = vec![vec![order[0]]];
    for (k, pair) in mjds.windows(2).enumerate() {
        if pair[1] - pair[0] > threshold {
            groups.push(Vec::new());
        }
        if let Some(group) = groups.last_mut() {
            group.push(order[k + 1]);
        }
    }
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    groups
}

#[derive(Debug, Clone)]
pub struct ClusterFit {
    pub outcome: FitOutcome,
    pub clusters_total: usize,
    /// Clusters folded in before the first failure (all of them on success).
    pub clusters_folded: usize,
}

/// Fold clusters in one at a time, refitting with `Direct` after each.
///
/// If a later fold fails, the last model that fit is evaluated on all TOAs
/// and returned.
pub fn clustering_fit(
    fitter: &dyn Fitter,
    toas: &[Toa],
    model: &TimingModel,
    mad_multiple: f64,
) -> TimingResult<ClusterFit> {
    let groups = clusters(toas, mad_multiple);
    let total = groups.len();
    info!(clusters = total, n_toas = toas.len(), "starting clustering fallback");

    let mut current = model.clone();
    let mut last_good: Option<FitResult> = None;
    let mut included: Vec<Toa> = Vec::with_capacity(toas.len());
    let mut folded = 0;

    for (k, group) in groups.iter().enumerate() {
        included.extend(group.iter().map(|&i| toas[i].clone()));
        included.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));

        match fitter.fit(&included, &current, FitStrategy::Direct)? {
            FitOutcome::Converged(result) => {
                debug!(cluster = k, n_toas = included.len(), chi2_reduced = result.chi2_reduced, "cluster folded in");
                current = result.model.clone();
                last_good = Some(result);
                folded = k + 1;
            }
            FitOutcome::Failed { reason } => {
                debug!(cluster = k, %reason, "cluster fit failed");
                break;
            }
        }
    }

    let outcome = match last_good {
        None => FitOutcome::failed("no cluster could be fit"),
        Some(result) if folded == total => FitOutcome::Converged(result),
        Some(result) => {
            let mut sorted = toas.to_vec();
            sorted.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
            let mut full = evaluate_model(&sorted, &result.model)?;
            full.iterations = result.iterations;
            FitOutcome::Converged(full)
        }
    };
    Ok(ClusterFit {
        outcome,
        clusters_total: total,
        clusters_folded: folded,
    })
}
