// Coefficients: E. Hairer & G. Wanner, "Solving Ordinary Differential
// Equations II" (1996), IV.7, subroutine RODAS of rodas.f.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use super::{all_finite, error_norm, initial_step, step_factor, OdeSettings, StepState, Stepper};
use crate::error::{FailureKind, Result};

const STAGES: usize = 6;
const ORDER: usize = 3; // order of the embedded error estimate

const GAMMA: f64 = 0.25;

const ALPHA: [f64; STAGES] = [0.0, 0.386, 0.21, 0.63, 1.0, 1.0];

/// Row sums of the full Gamma matrix, multiply the `df/dt` term.
const GAMMA_SUM: [f64; STAGES] = [0.25, -0.1043, 0.1035, -0.0362, 0.0, 0.0];

#[rustfmt::skip]
const A: [[f64; STAGES]; STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.544, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.9466785280815826, 0.2557011698983284, 0.0, 0.0, 0.0, 0.0],
    [3.314825187068521, 2.896124015972201, 0.9986419139977817, 0.0, 0.0, 0.0],
    [1.221224509226641, 6.019134481288629, 12.53708332932087, -0.6878860361058950, 0.0, 0.0],
    [1.221224509226641, 6.019134481288629, 12.53708332932087, -0.6878860361058950, 1.0, 0.0],
];

#[rustfmt::skip]
const C: [[f64; STAGES]; STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-5.6688, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-2.430093356833875, -0.2063599157091915, 0.0, 0.0, 0.0, 0.0],
    [-0.1073529058151375, -9.594562251023355, -20.47028614809616, 0.0, 0.0, 0.0],
    [7.496443313967647, -10.24680431464352, -33.99990352819905, 11.70890893206160, 0.0, 0.0],
    [8.083246795921522, -7.981132988064893, -31.52159432874371, 16.31930543123136, -6.058818238834054, 0.0],
];

// Stiffly accurate: the solution is the last stage point, the embedded
// solution drops k_6, so the error estimate is k_6 alone.
const M: [f64; STAGES] = [
    1.221224509226641,
    6.019134481288629,
    12.53708332932087,
    -0.6878860361058950,
    1.0,
    1.0,
];

/// RODAS4: 6-stage, order 4(3), L-stable Rosenbrock method.
///
/// Each step solves `(I/(h gamma) - J) k_i = f(t + alpha_i h, y + sum a_ij k_j)
/// + sum (c_ij / h) k_j + gamma_i h df/dt` with `J = df/dy` and `df/dt` taken by
/// forward differences, so it needs no user Jacobian. L-stability is what
/// lets the backward Riccati solve take large steps once `P` settles.
#[derive(Debug, Clone)]
pub struct Rodas4 {
    state: StepState,
}

impl Rodas4 {
    pub fn new(t0: f64, tf: f64, y0: DVector<f64>, settings: &OdeSettings) -> Result<Rodas4> {
        Ok(Rodas4 {
            state: StepState::new(t0, tf, y0, settings)?,
        })
    }

    /// Forward-difference `df/dy` at `(t, y)`, reusing `fy = f(t, y)`.
    fn jacobian<F>(f: &mut F, t: f64, y: &DVector<f64>, fy: &DVector<f64>) -> Result<DMatrix<f64>>
    where
        F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>> + ?Sized,
    {
        let n = y.len();
        let eps = f64::EPSILON.sqrt();
        let mut jac = DMatrix::zeros(n, n);
        for j in 0..n {
            let dy = eps * y[j].abs().max(1.0);
            let mut y_pert = y.clone();
            y_pert[j] += dy;
            let column = (f(t, &y_pert)? - fy) / dy;
            jac.set_column(j, &column);
        }
        Ok(jac)
    }

    /// Forward-difference `df/dt`, stepping towards `tf` so the probe stays
    /// inside the integration interval.
    fn time_derivative<F>(&self, f: &mut F, fy: &DVector<f64>) -> Result<DVector<f64>>
    where
        F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>> + ?Sized,
    {
        let state = &self.state;
        let size =
            (f64::EPSILON.sqrt() * state.t.abs().max(1.0)).min(0.5 * (state.tf - state.t).abs());
        let dt = size * state.direction();
        Ok((f(state.t + dt, &state.y)? - fy) / dt)
    }
}

impl Stepper for Rodas4 {
    fn t(&self) -> f64 {
        self.state.t
    }

    fn y(&self) -> &DVector<f64> {
        &self.state.y
    }

    fn finished(&self) -> bool {
        self.state.finished()
    }

    fn set_state(&mut self, y: DVector<f64>) {
        self.state.y = y;
    }

    fn step<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>> + ?Sized,
    {
        if self.finished() {
            return Ok(());
        }
        let t = self.state.t;
        let fy = f(t, &self.state.y)?;
        let mut h = match self.state.h {
            Some(h) => self.state.clip(h),
            None => initial_step(f, &self.state, &fy, ORDER)?,
        };
        let jac = Rodas4::jacobian(f, t, &self.state.y, &fy)?;
        let dfdt = self.time_derivative(f, &fy)?;
        let n = self.state.y.len();
        let mut rejected = false;

        loop {
            self.state.count_attempt()?;

            let w = DMatrix::<f64>::identity(n, n) / (h * GAMMA) - &jac;
            let lu = w.lu();
            let mut k: Vec<DVector<f64>> = Vec::with_capacity(STAGES);
            for i in 0..STAGES {
                let mut rhs = if i == 0 {
                    fy.clone()
                } else {
                    let mut y_stage = self.state.y.clone();
                    for (j, kj) in k.iter().enumerate() {
                        if A[i][j] != 0.0 {
                            y_stage += kj * A[i][j];
                        }
                    }
                    f(t + ALPHA[i] * h, &y_stage)?
                };
                for (j, kj) in k.iter().enumerate() {
                    rhs += kj * (C[i][j] / h);
                }
                if GAMMA_SUM[i] != 0.0 {
                    rhs += &dfdt * (GAMMA_SUM[i] * h);
                }
                let ki = lu
                    .solve(&rhs)
                    .ok_or_else(|| self.state.failure(FailureKind::SingularJacobian))?;
                k.push(ki);
            }

            let mut y_new = self.state.y.clone();
            for (ki, mi) in k.iter().zip(M.iter()) {
                y_new += ki * *mi;
            }
            let err = error_norm(&k[STAGES - 1], &self.state.y, &y_new, &self.state.settings);

            let finite = err.is_finite() && all_finite(&y_new);
            if finite && err <= 1.0 {
                let mut factor = step_factor(err, ORDER, &self.state.settings);
                if rejected {
                    factor = factor.min(1.0);
                }
                trace!(t, h, err, "rodas4 step accepted");
                self.state.advance(h, y_new);
                self.state.h = Some(h * factor);
                return Ok(());
            }

            let factor = if finite {
                step_factor(err, ORDER, &self.state.settings).min(1.0)
            } else {
                self.state.settings.min_factor
            };
            trace!(t, h, err, "rodas4 step rejected");
            h *= factor;
            rejected = true;
            if self.state.too_small(h) {
                let kind = if finite {
                    FailureKind::StepTooSmall
                } else {
                    FailureKind::NotFinite
                };
                return Err(self.state.failure(kind));
            }
        }
    }
}
