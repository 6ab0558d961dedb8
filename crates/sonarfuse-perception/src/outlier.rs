//! Residual outlier rejection.
//!
//! Residuals are measured against a fit: the mean for fusion candidates, a
//! least-squares line for calibration pairs.  Each residual gets a z-score
//! and samples scoring above the threshold are dropped.  Input order is
//! preserved.
//!
//! Two scores are available:
//!
//! - [`OutlierScore::Standard`]: `|rᵢ − mean(r)| / σ(r)`, the classic score.
//! - [`OutlierScore::Robust`]: `0.6745·|rᵢ − median(r)| / MAD(r)`.  A single
//!   spike cannot inflate the median absolute deviation, so it is caught
//!   even in small groups.  When the MAD collapses (more than half the
//!   residuals identical) the standard score is used instead.

use crate::fit::{mean, polyfit, polyval, std_dev};

/// Default rejection threshold for calibration pairs.
pub const CALIBRATION_OUTLIER_SIGMA: f64 = 2.0;

/// Default rejection threshold for fusion candidates.
pub const FUSION_OUTLIER_SIGMA: f64 = 3.0;

const MIN_SAMPLES: usize = 3;
const SIGMA_FLOOR: f64 = 1e-9;

/// Scales the MAD to σ for normally distributed residuals.
const MAD_TO_SIGMA: f64 = 0.6745;

/// How residuals are turned into z-scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutlierScore {
    #[default]
    Standard,
    Robust,
}

impl OutlierScore {
    /// Score every residual.
    ///
    /// `None` when there are fewer than three residuals or their spread is
    /// negligible; callers keep every sample in that case.
    pub fn scores(self, residuals: &[f64]) -> Option<Vec<f64>> {
        if residuals.len() < MIN_SAMPLES {
            return None;
        }
        match self {
            OutlierScore::Standard => standard_scores(residuals),
            OutlierScore::Robust => robust_scores(residuals).or_else(|| standard_scores(residuals)),
        }
    }
}

fn standard_scores(residuals: &[f64]) -> Option<Vec<f64>> {
    let center = mean(residuals)?;
    let sigma = std_dev(residuals)?;
    if !sigma.is_finite() || sigma <= SIGMA_FLOOR {
        return None;
    }
    Some(residuals.iter().map(|r| (r - center).abs() / sigma).collect())
}

fn robust_scores(residuals: &[f64]) -> Option<Vec<f64>> {
    let center = median(residuals)?;
    let deviations: Vec<f64> = residuals.iter().map(|r| (r - center).abs()).collect();
    let mad = median(&deviations)?;
    if !mad.is_finite() || mad <= SIGMA_FLOOR {
        return None;
    }
    Some(deviations.iter().map(|d| MAD_TO_SIGMA * d / mad).collect())
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn retain_by_scores<T: Clone>(
    items: &[T],
    residuals: &[f64],
    threshold_sigma: f64,
    score: OutlierScore,
) -> Vec<T> {
    match score.scores(residuals) {
        Some(scores) => items
            .iter()
            .zip(scores)
            .filter(|(_, z)| *z <= threshold_sigma)
            .map(|(item, _)| item.clone())
            .collect(),
        None => items.to_vec(),
    }
}

/// Drop keyed samples whose deviation from the sample mean is anomalous.
pub fn remove_outliers<K: Clone>(
    samples: &[(K, f64)],
    threshold_sigma: f64,
    score: OutlierScore,
) -> Vec<(K, f64)> {
    let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
    let Some(center) = mean(&values) else {
        return Vec::new();
    };
    let residuals: Vec<f64> = values.iter().map(|v| v - center).collect();
    retain_by_scores(samples, &residuals, threshold_sigma, score)
}

/// Drop `(measured, true)` pairs that sit far from the least-squares line of
/// true on measured, using the robust score.  Pairs whose measured values
/// have no spread are returned unchanged.
pub fn remove_fit_outliers(pairs: &[(f64, f64)], threshold_sigma: f64) -> Vec<(f64, f64)> {
    if pairs.len() < MIN_SAMPLES {
        return pairs.to_vec();
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
    let Some(line) = polyfit(&xs, &ys, 1) else {
        return pairs.to_vec();
    };
    let residuals: Vec<f64> = pairs.iter().map(|(x, y)| y - polyval(&line, *x)).collect();
    retain_by_scores(pairs, &residuals, threshold_sigma, OutlierScore::Robust)
}
