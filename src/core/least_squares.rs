//! Dense least-squares fits for offset and mapping models

use nalgebra::{DMatrix, DVector, SVD};

/// Singular values below this fraction of the largest count as zero
const RANK_TOLERANCE: f64 = 1e-10;

/// Solve `min ||A x - b||` by SVD.
///
/// `rows` holds the design matrix one observation per entry. Returns `None`
/// for an under-determined or rank-deficient system.
pub fn solve(rows: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = rows.first()?.len();
    if n == 0 || rows.len() < n || rows.len() != rhs.len() || rows.iter().any(|r| r.len() != n) {
        return None;
    }

    let a = DMatrix::from_fn(rows.len(), n, |i, j| rows[i][j]);
    let b = DVector::from_column_slice(rhs);

    let svd = SVD::new(a, true, true);
    let largest = svd.singular_values.max();
    let smallest = svd.singular_values.min();
    if !largest.is_finite() || largest <= 0.0 || smallest <= RANK_TOLERANCE * largest {
        return None;
    }

    let x = svd.solve(&b, RANK_TOLERANCE * largest).ok()?;
    if x.iter().all(|v| v.is_finite()) {
        Some(x.iter().copied().collect())
    } else {
        None
    }
}
