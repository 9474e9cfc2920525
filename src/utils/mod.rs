pub mod interp;

use nalgebra::DMatrix;

/// `(M + M^T) / 2`
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Largest absolute entry, `0` for an empty matrix.
pub fn max_abs(m: &DMatrix<f64>) -> f64 {
    m.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}
