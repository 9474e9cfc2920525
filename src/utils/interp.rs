use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// `ts` strictly increasing with at least `min` knots, one value per knot,
/// all values the same shape.
fn check_knots(ts: &[f64], ys: &[DMatrix<f64>], min: usize) -> Result<()> {
    if ts.len() < min {
        return Err(Error::invalid(format!("need at least {min} knots, got {}", ts.len())));
    }
    if ys.len() != ts.len() {
        return Err(Error::shape(format!("{} knot times but {} values", ts.len(), ys.len())));
    }
    if !ts.iter().all(|t| t.is_finite()) || ts.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::invalid("knot times must be finite and strictly increasing"));
    }
    if ys.iter().any(|y| y.shape() != ys[0].shape()) {
        return Err(Error::shape("knot values differ in shape"));
    }
    Ok(())
}

/// Index `i` of the segment `[ts[i], ts[i + 1]]` containing `t`.
/// `ts` must be strictly increasing with at least two knots.
fn find_segment(ts: &[f64], t: f64) -> usize {
    ts.partition_point(|&x| x <= t)
        .saturating_sub(1)
        .min(ts.len() - 2)
}

/// Natural cubic spline through matrix-valued knots, element by element.
///
/// Segment `i` stores `[a, b, c, d]` for
/// `S_i(t) = a + b (t - t_i) + c (t - t_i)^2 + d (t - t_i)^3`.
/// The second derivatives at the interior knots come from the usual
/// tridiagonal system, solved with the Thomas algorithm; the system
/// coefficients are scalars so the sweep works on whole matrices.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    ts: Vec<f64>,
    coeffs: Vec<[DMatrix<f64>; 4]>,
}

impl CubicSpline {
    /// `ts` strictly increasing, at least 3 knots, all values the same shape.
    pub fn new(ts: Vec<f64>, ys: &[DMatrix<f64>]) -> Result<CubicSpline> {
        check_knots(&ts, ys, 3)?;
        let n = ts.len();
        let (rows, cols) = ys[0].shape();
        let zero = DMatrix::<f64>::zeros(rows, cols);

        let h: Vec<f64> = ts.windows(2).map(|w| w[1] - w[0]).collect();
        let delta: Vec<DMatrix<f64>> = (0..n - 1).map(|i| (&ys[i + 1] - &ys[i]) / h[i]).collect();

        // second derivatives, m[0] = m[n-1] = 0
        let mut m = vec![zero.clone(); n];
        let mut cp = vec![0.0; n];
        let mut dp = vec![zero; n];

        let diag = 2.0 * (h[0] + h[1]);
        cp[1] = h[1] / diag;
        dp[1] = (&delta[1] - &delta[0]) * (6.0 / diag);
        for i in 2..n - 1 {
            let diag_i = 2.0 * (h[i - 1] + h[i]) - h[i - 1] * cp[i - 1];
            cp[i] = h[i] / diag_i;
            dp[i] = ((&delta[i] - &delta[i - 1]) * 6.0 - &dp[i - 1] * h[i - 1]) / diag_i;
        }

        m[n - 2] = dp[n - 2].clone();
        for i in (1..n - 2).rev() {
            m[i] = &dp[i] - &m[i + 1] * cp[i];
        }

        let coeffs = (0..n - 1)
            .map(|i| {
                let a = ys[i].clone();
                let b = &delta[i] - (&m[i] * 2.0 + &m[i + 1]) * (h[i] / 6.0);
                let c = &m[i] / 2.0;
                let d = (&m[i + 1] - &m[i]) / (6.0 * h[i]);
                [a, b, c, d]
            })
            .collect();

        Ok(CubicSpline { ts, coeffs })
    }

    pub fn eval(&self, t: f64) -> DMatrix<f64> {
        let i = find_segment(&self.ts, t);
        let dx = t - self.ts[i];
        let [a, b, c, d] = &self.coeffs[i];
        a + (b + (c + d * dx) * dx) * dx
    }

    pub fn eval_derivative(&self, t: f64) -> DMatrix<f64> {
        let i = find_segment(&self.ts, t);
        let dx = t - self.ts[i];
        let [_, b, c, d] = &self.coeffs[i];
        b + (c * 2.0 + d * (3.0 * dx)) * dx
    }
}

/// Piecewise-linear interpolant through matrix-valued knots.
#[derive(Debug, Clone)]
pub struct LinearInterp {
    ts: Vec<f64>,
    ys: Vec<DMatrix<f64>>,
}

impl LinearInterp {
    /// `ts` strictly increasing, at least 2 knots.
    pub fn new(ts: Vec<f64>, ys: Vec<DMatrix<f64>>) -> Result<LinearInterp> {
        check_knots(&ts, &ys, 2)?;
        Ok(LinearInterp { ts, ys })
    }

    pub fn eval(&self, t: f64) -> DMatrix<f64> {
        let i = find_segment(&self.ts, t);
        let w = (t - self.ts[i]) / (self.ts[i + 1] - self.ts[i]);
        &self.ys[i] + (&self.ys[i + 1] - &self.ys[i]) * w
    }

    pub fn eval_derivative(&self, t: f64) -> DMatrix<f64> {
        let i = find_segment(&self.ts, t);
        (&self.ys[i + 1] - &self.ys[i]) / (self.ts[i + 1] - self.ts[i])
    }
}

/// Interpolant for one trajectory field.
#[derive(Debug, Clone)]
pub enum Interpolant {
    /// Single knot: the domain is the point itself.
    Constant(DMatrix<f64>),
    Linear(LinearInterp),
    Cubic(CubicSpline),
}

impl Interpolant {
    pub fn eval(&self, t: f64) -> DMatrix<f64> {
        match self {
            Interpolant::Constant(value) => value.clone(),
            Interpolant::Linear(interp) => interp.eval(t),
            Interpolant::Cubic(spline) => spline.eval(t),
        }
    }

    pub fn eval_derivative(&self, t: f64) -> DMatrix<f64> {
        match self {
            Interpolant::Constant(value) => DMatrix::zeros(value.nrows(), value.ncols()),
            Interpolant::Linear(interp) => interp.eval_derivative(t),
            Interpolant::Cubic(spline) => spline.eval_derivative(t),
        }
    }
}
