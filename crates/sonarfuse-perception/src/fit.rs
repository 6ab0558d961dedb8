//! Numerical building blocks: summary statistics, least-squares solving,
//! polynomial regression and exponential curve fitting.
//!
//! Least squares is solved with Householder QR rather than the normal
//! equations, which keeps quadratic fits over raw centimetre values (where
//! `x²` reaches 1.6·10⁵) well conditioned.

/// Relative size below which a column is considered linearly dependent on the
/// previous ones.
const RANK_TOLERANCE: f64 = 1e-10;

/// Arithmetic mean.  `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.  `None` for an empty slice.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

// ────────────────────────────────────────────────────────────────────────────
// Linear least squares
// ────────────────────────────────────────────────────────────────────────────

/// Solve `min ‖A·x − b‖₂` for an `m × n` design matrix given as rows.
///
/// Returns `None` when the system is underdetermined (`m < n`), the
/// dimensions disagree, or `A` is numerically rank-deficient.
pub fn least_squares(rows: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
    let m = rows.len();
    let n = rows.first()?.len();
    if n == 0 || m < n || rhs.len() != m || rows.iter().any(|r| r.len() != n) {
        return None;
    }

    let mut r: Vec<Vec<f64>> = rows.to_vec();
    let mut y = rhs.to_vec();
    let col_norms: Vec<f64> = (0..n)
        .map(|j| r.iter().map(|row| row[j] * row[j]).sum::<f64>().sqrt())
        .collect();

    for k in 0..n {
        let norm = (k..m).map(|i| r[i][k] * r[i][k]).sum::<f64>().sqrt();
        if !norm.is_finite() || norm <= RANK_TOLERANCE * col_norms[k].max(f64::MIN_POSITIVE) {
            return None;
        }
        let alpha = if r[k][k] > 0.0 { -norm } else { norm };

        let mut v: Vec<f64> = (k..m).map(|i| r[i][k]).collect();
        v[0] -= alpha;
        let v_norm2: f64 = v.iter().map(|x| x * x).sum();

        for j in k..n {
            let dot: f64 = (k..m).map(|i| v[i - k] * r[i][j]).sum();
            let f = 2.0 * dot / v_norm2;
            for i in k..m {
                r[i][j] -= f * v[i - k];
            }
        }
        let dot: f64 = (k..m).map(|i| v[i - k] * y[i]).sum();
        let f = 2.0 * dot / v_norm2;
        for i in k..m {
            y[i] -= f * v[i - k];
        }
    }

    let mut x = vec![0.0; n];
    for k in (0..n).rev() {
        let tail: f64 = (k + 1..n).map(|j| r[k][j] * x[j]).sum();
        x[k] = (y[k] - tail) / r[k][k];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

// ────────────────────────────────────────────────────────────────────────────
// Polynomials
// ────────────────────────────────────────────────────────────────────────────

/// Least-squares polynomial of `degree` through `(xs, ys)`, highest power
/// first.
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Vec<f64>> {
    if xs.len() != ys.len() {
        return None;
    }
    let rows: Vec<Vec<f64>> = xs
        .iter()
        .map(|&x| (0..=degree).rev().map(|p| x.powi(p as i32)).collect())
        .collect();
    least_squares(&rows, ys)
}

/// Evaluate a highest-power-first polynomial at `x`.
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, c| acc * x + c)
}

// ────────────────────────────────────────────────────────────────────────────
// Exponential fit: y = a·e^(b·x) + c
// ────────────────────────────────────────────────────────────────────────────

/// Why an exponential fit produced no parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpFitFailure {
    /// Fewer than three points for three parameters.
    Underdetermined,
    /// The iteration budget ran out before convergence.
    NotConverged { iterations: usize },
    /// The model overflowed or produced NaN.
    NonFinite { iterations: usize },
}

const EXP_REL_TOLERANCE: f64 = 1e-12;
const EXP_STEP_TOLERANCE: f64 = 1e-12;
const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;

fn exp_sse(xs: &[f64], ys: &[f64], p: [f64; 3]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - (p[0] * (p[1] * x).exp() + p[2]);
            r * r
        })
        .sum()
}

/// Fit `y = a·e^(b·x) + c` with Levenberg–Marquardt, starting from
/// `initial = [a, b, c]` and taking at most `max_iterations` accepted steps.
///
/// A point where no damped step reduces the residual any further is a local
/// minimum and counts as converged.
pub fn fit_exponential(
    xs: &[f64],
    ys: &[f64],
    initial: [f64; 3],
    max_iterations: usize,
) -> Result<[f64; 3], ExpFitFailure> {
    if xs.len() != ys.len() || xs.len() < 3 {
        return Err(ExpFitFailure::Underdetermined);
    }

    let mut p = initial;
    let mut sse = exp_sse(xs, ys, p);
    if !sse.is_finite() {
        return Err(ExpFitFailure::NonFinite { iterations: 0 });
    }
    let mut lambda = LAMBDA_INITIAL;

    for iteration in 1..=max_iterations {
        let mut jtj = [[0.0f64; 3]; 3];
        let mut jtr = [0.0f64; 3];
        for (&x, &y) in xs.iter().zip(ys) {
            let e = (p[1] * x).exp();
            let residual = y - (p[0] * e + p[2]);
            let j = [e, p[0] * x * e, 1.0];
            for a in 0..3 {
                jtr[a] += j[a] * residual;
                for b in 0..3 {
                    jtj[a][b] += j[a] * j[b];
                }
            }
        }
        if jtr.iter().chain(jtj.iter().flatten()).any(|v| !v.is_finite()) {
            return Err(ExpFitFailure::NonFinite { iterations: iteration });
        }
        if sse == 0.0 {
            return Ok(p);
        }

        loop {
            let rows: Vec<Vec<f64>> = (0..3)
                .map(|a| {
                    (0..3)
                        .map(|b| {
                            if a == b {
                                jtj[a][b] + lambda * jtj[a][a].max(1e-12)
                            } else {
                                jtj[a][b]
                            }
                        })
                        .collect()
                })
                .collect();

            if let Some(delta) = least_squares(&rows, &jtr) {
                let candidate = [p[0] + delta[0], p[1] + delta[1], p[2] + delta[2]];
                let candidate_sse = exp_sse(xs, ys, candidate);
                if candidate_sse.is_finite() && candidate_sse <= sse {
                    let step = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
                    let scale = candidate.iter().map(|v| v * v).sum::<f64>().sqrt();
                    let converged = sse - candidate_sse <= EXP_REL_TOLERANCE * sse
                        || step <= EXP_STEP_TOLERANCE * (scale + EXP_STEP_TOLERANCE);
                    p = candidate;
                    sse = candidate_sse;
                    lambda = (lambda / 10.0).max(1e-15);
                    if converged {
                        return Ok(p);
                    }
                    break;
                }
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                return Ok(p);
            }
        }
    }

    Err(ExpFitFailure::NotConverged {
        iterations: max_iterations,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
        let sd = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn polyfit_recovers_line() {
        let xs: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 3.0).collect();
        let c = polyfit(&xs, &ys, 1).unwrap();
        assert!((c[0] - 2.0).abs() < 1e-9);
        assert!((c[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn polyfit_recovers_quadratic_over_centimetres() {
        let xs: Vec<f64> = (1..=12).map(|i| i as f64 * 30.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 0.001 * x * x + 0.9 * x - 1.5).collect();
        let c = polyfit(&xs, &ys, 2).unwrap();
        assert!((c[0] - 0.001).abs() < 1e-9);
        assert!((c[1] - 0.9).abs() < 1e-6);
        assert!((c[2] + 1.5).abs() < 1e-5);
        assert!((polyval(&c, 200.0) - (40.0 + 180.0 - 1.5)).abs() < 1e-6);
    }

    #[test]
    fn least_squares_rejects_rank_deficiency() {
        // All x identical: the slope column duplicates the intercept column.
        assert!(polyfit(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0], 1).is_none());
        // Underdetermined.
        assert!(polyfit(&[1.0, 2.0], &[1.0, 2.0], 2).is_none());
        // Mismatched lengths.
        assert!(polyfit(&[1.0, 2.0, 3.0], &[1.0, 2.0], 1).is_none());
    }

    #[test]
    fn least_squares_solves_square_system() {
        let rows = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let x = least_squares(&rows, &[3.0, 5.0]).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn exponential_fit_converges_on_exact_data() {
        let xs: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * (0.02 * x).exp() + 1.0).collect();
        let p = fit_exponential(&xs, &ys, [1.0, 0.01, 0.0], 200).unwrap();
        assert!((p[0] - 2.0).abs() < 1e-4, "a = {}", p[0]);
        assert!((p[1] - 0.02).abs() < 1e-6, "b = {}", p[1]);
        assert!((p[2] - 1.0).abs() < 1e-3, "c = {}", p[2]);
    }

    #[test]
    fn exponential_fit_respects_iteration_budget() {
        let xs: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * (0.02 * x).exp() + 1.0).collect();
        assert_eq!(
            fit_exponential(&xs, &ys, [1.0, 0.01, 0.0], 1),
            Err(ExpFitFailure::NotConverged { iterations: 1 })
        );
    }

    #[test]
    fn exponential_fit_needs_three_points() {
        assert_eq!(
            fit_exponential(&[1.0, 2.0], &[1.0, 2.0], [1.0, 0.01, 0.0], 10),
            Err(ExpFitFailure::Underdetermined)
        );
    }

    #[test]
    fn exponential_fit_reports_overflow() {
        let xs = [1.0e6, 2.0e6, 3.0e6];
        let ys = [1.0, 2.0, 3.0];
        assert!(matches!(
            fit_exponential(&xs, &ys, [1.0, 0.01, 0.0], 10),
            Err(ExpFitFailure::NonFinite { .. })
        ));
    }
}
