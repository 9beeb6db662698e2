//! Ordinary least squares and error statistics
//!
//! Features are mean-centered before forming the normal equations, which
//! keeps the system well conditioned when drivers have large offsets
//! (production counts in the thousands next to temperatures near zero).

/// Result of an OLS fit with intercept
#[derive(Debug, Clone, PartialEq)]
pub struct OlsFit {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl OlsFit {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }
}

/// Relative pivot tolerance for detecting a singular system
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Fit `y = intercept + sum(b_i * x_i)` by least squares.
///
/// Returns `None` when there are fewer rows than parameters or when the
/// drivers are collinear (singular normal equations).
pub fn fit_ols(rows: &[Vec<f64>], targets: &[f64]) -> Option<OlsFit> {
    let n = rows.len();
    let k = rows.first().map(|r| r.len())?;
    if n != targets.len() || n <= k || rows.iter().any(|r| r.len() != k) {
        return None;
    }

    let nf = n as f64;
    let mut means = vec![0.0; k];
    for row in rows {
        for (m, x) in means.iter_mut().zip(row) {
            *m += x / nf;
        }
    }
    let mean_y = targets.iter().sum::<f64>() / nf;

    // Normal equations on centered data: (Xc^T Xc) b = Xc^T yc
    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, y) in rows.iter().zip(targets) {
        let yc = y - mean_y;
        for i in 0..k {
            let xi = row[i] - means[i];
            xty[i] += xi * yc;
            for j in i..k {
                xtx[i][j] += xi * (row[j] - means[j]);
            }
        }
    }
    for i in 0..k {
        for j in 0..i {
            xtx[i][j] = xtx[j][i];
        }
    }

    let coefficients = solve_linear_system(xtx, xty)?;
    let intercept = mean_y
        - coefficients
            .iter()
            .zip(&means)
            .map(|(b, m)| b * m)
            .sum::<f64>();

    Some(OlsFit {
        intercept,
        coefficients,
    })
}

/// Gaussian elimination with partial pivoting
fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let k = b.len();
    let scale = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0_f64, f64::max);
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }
    let tolerance = scale * PIVOT_TOLERANCE;

    for col in 0..k {
        let pivot_row = (col..k).max_by(|&r1, &r2| {
            a[r1][col]
                .abs()
                .partial_cmp(&a[r2][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row][col].abs() < tolerance {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..k {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for j in col..k {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; k];
    for row in (0..k).rev() {
        let tail: f64 = ((row + 1)..k).map(|j| a[row][j] * x[j]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

/// Mean and sample standard deviation (Bessel's correction)
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// R² from residual and total sums of squares.
///
/// A constant target gives 1.0 when it is fit exactly and 0.0 otherwise.
pub fn r_squared_from_sums(ss_res: f64, ss_tot: f64) -> f64 {
    if ss_tot.abs() < f64::EPSILON {
        return if ss_res.abs() < f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Error summary of predictions against actual values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorSummary {
    pub count: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r_squared: f64,
}

impl ErrorSummary {
    /// Summarize `(actual, predicted)` pairs; `None` when empty
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Option<Self> {
        if pairs.is_empty() {
            return None;
        }
        let n = pairs.len() as f64;
        let mean_actual = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;

        let mut abs_sum = 0.0;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (actual, predicted) in pairs {
            let err = actual - predicted;
            abs_sum += err.abs();
            ss_res += err * err;
            ss_tot += (actual - mean_actual).powi(2);
        }

        Some(Self {
            count: pairs.len(),
            mae: abs_sum / n,
            rmse: (ss_res / n).sqrt(),
            r_squared: r_squared_from_sums(ss_res, ss_tot),
        })
    }
}
