use std::cell::OnceCell;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::system::{check_shape, solve_r, validate_dims};
use crate::error::{Error, Result};
use crate::utils::symmetrize;

/// Settings of the matrix sign iteration behind [`solve_care`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignSettings {
    /// Relative change between iterates that counts as converged
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for SignSettings {
    fn default() -> Self {
        Self {
            tol: 1e-12,
            max_iter: 100,
        }
    }
}

fn check_problem(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<(usize, usize)> {
    let (n, m) = validate_dims(a, b)?;
    check_shape("Q", q, n, n)?;
    check_shape("R", r, m, m)?;
    Ok((n, m))
}

/// `B R^{-1} B^T`
fn control_weight(b: &DMatrix<f64>, r: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    Ok(b * solve_r(r, &b.transpose())?)
}

/// Sign of `z` by scaled Newton iteration `Z <- (Z/c + c Z^{-1}) / 2`,
/// `c = |det Z|^(1/dim)`.
fn matrix_sign(mut z: DMatrix<f64>, settings: &SignSettings) -> Result<DMatrix<f64>> {
    let dim = z.nrows() as f64;
    let mut last_change = f64::INFINITY;
    for iter in 0..settings.max_iter {
        let lu = z.clone().lu();
        let det = lu.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(Error::SingularSubspace {
                what: "Hamiltonian has eigenvalues on the imaginary axis",
            });
        }
        let inverse = lu.try_inverse().ok_or(Error::SingularSubspace {
            what: "Hamiltonian has eigenvalues on the imaginary axis",
        })?;
        let c = det.abs().powf(1.0 / dim);
        let next = (&z / c + inverse * c) * 0.5;
        let change = (&next - &z).norm();
        let size = next.norm();
        z = next;
        // below the relative tolerance, or stuck at the rounding floor
        if change <= settings.tol * size || (change <= 1e-8 * size && change >= 0.5 * last_change) {
            debug!(iterations = iter + 1, change, "matrix sign converged");
            return Ok(z);
        }
        last_change = change;
    }
    Err(Error::SingularSubspace {
        what: "matrix sign iteration did not converge",
    })
}

/// Stabilizing solution of `A^T P + P A - P B R^{-1} B^T P + Q = 0`.
///
/// The stable invariant subspace of `H = [[A, -B R^{-1} B^T], [-Q, -A^T]]` is
/// the null space of `sign(H) + I`, spanned by `[I; P]`. Writing
/// `S = sign(H)` in `n x n` blocks, `P` solves
/// `[S12; S22 + I] P = -[S11 + I; S21]` in the least-squares sense.
pub fn solve_care(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
    settings: &SignSettings,
) -> Result<DMatrix<f64>> {
    let (n, _) = check_problem(a, b, q, r)?;
    let g = control_weight(b, r)?;

    let mut h = DMatrix::zeros(2 * n, 2 * n);
    h.view_mut((0, 0), (n, n)).copy_from(a);
    h.view_mut((0, n), (n, n)).copy_from(&(-g));
    h.view_mut((n, 0), (n, n)).copy_from(&(-q));
    h.view_mut((n, n), (n, n)).copy_from(&(-a.transpose()));

    let s = matrix_sign(h, settings)?;

    // eigenvalues of S are +-1, so the trace counts the unstable ones
    let stable = (2.0 * n as f64 - s.trace()) / 2.0;
    if (stable - n as f64).abs() > 0.5 {
        return Err(Error::SingularSubspace {
            what: "stable subspace does not have dimension n",
        });
    }

    let mut basis = DMatrix::zeros(2 * n, n);
    basis.view_mut((0, 0), (n, n)).copy_from(&s.view((0, n), (n, n)));
    basis
        .view_mut((n, 0), (n, n))
        .copy_from(&(s.view((n, n), (n, n)) + DMatrix::<f64>::identity(n, n)));
    let mut rhs = DMatrix::zeros(2 * n, n);
    rhs.view_mut((0, 0), (n, n))
        .copy_from(&(-(s.view((0, 0), (n, n)) + DMatrix::<f64>::identity(n, n))));
    rhs.view_mut((n, 0), (n, n)).copy_from(&(-s.view((n, 0), (n, n))));

    let svd = basis.svd(true, true);
    let largest = svd.singular_values.max();
    if svd.rank(largest * 1e-10) < n {
        return Err(Error::SingularSubspace {
            what: "stable subspace basis is rank deficient",
        });
    }
    let p = svd.solve(&rhs, largest * 1e-14).map_err(|_| Error::SingularSubspace {
        what: "stable subspace basis is rank deficient",
    })?;
    Ok(symmetrize(&p))
}

/// `A^T P + P A - P B R^{-1} B^T P + Q`, zero at a solution.
pub fn care_residual(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
    p: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let (n, _) = check_problem(a, b, q, r)?;
    check_shape("P", p, n, n)?;
    let g = control_weight(b, r)?;
    Ok(a.transpose() * p + p * a - p * g * p + q)
}

/// Algebraic Riccati problem for constant `(A, B, Q, R)`, solved once on
/// first access.
#[derive(Debug, Clone)]
pub struct Care {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    settings: SignSettings,
    p: OnceCell<DMatrix<f64>>,
}

impl Care {
    /// `Q = I_n`, `R = I_m`.
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>) -> Result<Care> {
        let (n, m) = validate_dims(&a, &b)?;
        Care::with_weights(a, b, DMatrix::identity(n, n), DMatrix::identity(m, m))
    }

    pub fn with_weights(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
    ) -> Result<Care> {
        check_problem(&a, &b, &q, &r)?;
        Ok(Care {
            a,
            b,
            q,
            r,
            settings: SignSettings::default(),
            p: OnceCell::new(),
        })
    }

    pub fn with_settings(mut self, settings: SignSettings) -> Care {
        self.settings = settings;
        self.p = OnceCell::new();
        self
    }

    /// The stabilizing solution `P`.
    pub fn solution(&self) -> Result<&DMatrix<f64>> {
        if let Some(p) = self.p.get() {
            return Ok(p);
        }
        let p = solve_care(&self.a, &self.b, &self.q, &self.r, &self.settings)?;
        Ok(self.p.get_or_init(|| p))
    }

    /// Steady-state gain `R^{-1} B^T P`.
    pub fn gain(&self) -> Result<DMatrix<f64>> {
        let p = self.solution()?;
        solve_r(&self.r, &(self.b.transpose() * p))
    }

    pub fn residual(&self) -> Result<DMatrix<f64>> {
        care_residual(&self.a, &self.b, &self.q, &self.r, self.solution()?)
    }
}
