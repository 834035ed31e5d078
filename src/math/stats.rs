//! Robust statistics and the nested-model F-test.

use statrs::distribution::{ContinuousCDF, FisherSnedecor};

/// Scale factor turning a MAD into a Gaussian-consistent standard deviation.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of a slice (copies; NaNs sort as equal).
pub fn median(values: &[f64]) -> Option<f64> {
    let mut buf = values.to_vec();
    median_mut(&mut buf)
}

pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Median absolute deviation about the median, unscaled.
pub fn mad(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let mut dev: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median_mut(&mut dev)
}

/// Percentile with linear interpolation between closest ranks (`q` in 0..=100).
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Robust z-score of `point` against `samples`, using `MAD × 1.4826` as σ.
///
/// Zero when the samples carry no spread.
pub fn mad_z_score(samples: &[f64], point: f64) -> f64 {
    let (Some(center), Some(spread)) = (median(samples), mad(samples)) else {
        return 0.0;
    };
    let sigma = spread * MAD_TO_SIGMA;
    if sigma > 0.0 {
        (point - center).abs() / sigma
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FTest {
    pub f_stat: f64,
    pub p_value: f64,
}

/// F-test of a nested model pair.
///
/// `rss_*` are (weighted) residual sums of squares and `dof_*` the residual
/// degrees of freedom of the reference (fewer parameters) and augmented fits.
/// Degenerate inputs give `p = 1`, so they can never pass a threshold.
pub fn f_test(rss_ref: f64, dof_ref: f64, rss_aug: f64, dof_aug: f64) -> FTest {
    let reject = FTest {
        f_stat: 0.0,
        p_value: 1.0,
    };
    let extra = dof_ref - dof_aug;
    if !(extra > 0.0 && dof_aug > 0.0 && rss_aug > 0.0) {
        return reject;
    }
    if !(rss_ref.is_finite() && rss_aug.is_finite()) {
        return reject;
    }

    let f_stat = ((rss_ref - rss_aug) / extra) / (rss_aug / dof_aug);
    if !f_stat.is_finite() || f_stat <= 0.0 {
        return FTest { f_stat, p_value: 1.0 };
    }

    match FisherSnedecor::new(extra, dof_aug) {
        Ok(dist) => FTest {
            f_stat,
            p_value: dist.sf(f_stat).clamp(0.0, 1.0),
        },
        Err(_) => reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_and_mad() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        // deviations from 3: [2, 1, 0, 1, 97] -> median 1
        assert_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 100.0]), Some(1.0));
    }

    #[test]
    fn percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(5.0));
        assert_eq!(percentile(&v, 25.0), Some(2.0));
        assert!((percentile(&[1.0, 2.0], 25.0).unwrap() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn robust_z_score_ignores_flat_samples() {
        assert_eq!(mad_z_score(&[1.0, 1.0, 1.0], 5.0), 0.0);
        let z = mad_z_score(&[0.0, 1.0, 2.0, 3.0, 4.0], 12.0);
        assert!((z - 10.0 / MAD_TO_SIGMA).abs() < 1e-9);
    }

    #[test]
    fn f_test_detects_large_improvement() {
        let strong = f_test(500.0, 48.0, 50.0, 47.0);
        assert!(strong.p_value < 1e-6);

        let weak = f_test(50.5, 48.0, 50.0, 47.0);
        assert!(weak.p_value > 0.3);
    }

    #[test]
    fn f_test_degenerate_inputs_never_pass() {
        assert_eq!(f_test(10.0, 5.0, 11.0, 4.0).p_value, 1.0);
        assert_eq!(f_test(10.0, 5.0, 1.0, 5.0).p_value, 1.0);
        assert_eq!(f_test(10.0, 5.0, 0.0, 4.0).p_value, 1.0);
        assert_eq!(f_test(f64::NAN, 5.0, 1.0, 4.0).p_value, 1.0);
    }
}
