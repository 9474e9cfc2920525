use nalgebra::DVector;
use tracing::trace;

use super::{all_finite, error_norm, initial_step, step_factor, OdeSettings, StepState, Stepper};
use crate::error::{FailureKind, Result};

const STAGES: usize = 7;
const ORDER: usize = 4;

const C: [f64; STAGES] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

#[rustfmt::skip]
const A: [[f64; STAGES]; STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0, 0.0],
    [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0, 0.0],
    [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0, 0.0],
    [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0],
];

/// 5th order weights (same as the last row of `A`).
const B: [f64; STAGES] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];

/// Difference between the 5th and the embedded 4th order weights.
const E: [f64; STAGES] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

/// Dormand-Prince 5(4) explicit Runge-Kutta stepper.
#[derive(Debug, Clone)]
pub struct Dopri5 {
    state: StepState,
}

impl Dopri5 {
    pub fn new(t0: f64, tf: f64, y0: DVector<f64>, settings: &OdeSettings) -> Result<Dopri5> {
        Ok(Dopri5 {
            state: StepState::new(t0, tf, y0, settings)?,
        })
    }
}

impl Stepper for Dopri5 {
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
        // k1 is recomputed each step since set_state may have changed y
        let k1 = f(t, &self.state.y)?;
        let mut h = match self.state.h {
            Some(h) => self.state.clip(h),
            None => initial_step(f, &self.state, &k1, ORDER)?,
        };
        let mut rejected = false;

        loop {
            self.state.count_attempt()?;

            let mut k: Vec<DVector<f64>> = Vec::with_capacity(STAGES);
            k.push(k1.clone());
            for i in 1..STAGES {
                let mut y_stage = self.state.y.clone();
                for (j, kj) in k.iter().enumerate() {
                    if A[i][j] != 0.0 {
                        y_stage += kj * (A[i][j] * h);
                    }
                }
                k.push(f(t + C[i] * h, &y_stage)?);
            }

            let mut y_new = self.state.y.clone();
            let mut err_vec = DVector::zeros(y_new.len());
            for (i, ki) in k.iter().enumerate() {
                if B[i] != 0.0 {
                    y_new += ki * (B[i] * h);
                }
                if E[i] != 0.0 {
                    err_vec += ki * (E[i] * h);
                }
            }
            let err = error_norm(&err_vec, &self.state.y, &y_new, &self.state.settings);

            let finite = err.is_finite() && all_finite(&y_new);
            if finite && err <= 1.0 {
                let mut factor = step_factor(err, ORDER, &self.state.settings);
                if rejected {
                    factor = factor.min(1.0);
                }
                trace!(t, h, err, "dopri5 step accepted");
                self.state.advance(h, y_new);
                self.state.h = Some(h * factor);
                return Ok(());
            }

            let factor = if finite {
                step_factor(err, ORDER, &self.state.settings).min(1.0)
            } else {
                self.state.settings.min_factor
            };
            trace!(t, h, err, "dopri5 step rejected");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn harmonic_oscillator() {
        let settings = OdeSettings::default();
        let y0 = DVector::from_vec(vec![1.0, 0.0]);
        let mut stepper = Dopri5::new(0.0, 2.0 * std::f64::consts::PI, y0, &settings).unwrap();
        let mut f = |_t: f64, y: &DVector<f64>| -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![y[1], -y[0]]))
        };
        while !stepper.finished() {
            stepper.step(&mut f).unwrap();
        }
        approx::assert_abs_diff_eq!(stepper.y()[0], 1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(stepper.y()[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn set_state_takes_effect() {
        let settings = OdeSettings::default();
        let mut stepper = Dopri5::new(0.0, 1.0, DVector::from_vec(vec![0.0]), &settings).unwrap();
        let mut f = |_t: f64, _y: &DVector<f64>| -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![1.0]))
        };
        stepper.step(&mut f).unwrap();
        let y = stepper.y()[0] + 10.0;
        stepper.set_state(DVector::from_vec(vec![y]));
        while !stepper.finished() {
            stepper.step(&mut f).unwrap();
        }
        approx::assert_abs_diff_eq!(stepper.y()[0], 11.0, epsilon = 1e-10);
    }

    #[test]
    fn max_steps_is_enforced() {
        let settings = OdeSettings {
            max_steps: 5,
            max_step: Some(0.01),
            ..OdeSettings::default()
        };
        let mut stepper = Dopri5::new(0.0, 1.0, DVector::from_vec(vec![1.0]), &settings).unwrap();
        let mut f = |_t: f64, y: &DVector<f64>| -> Result<DVector<f64>> { Ok(-y) };
        let mut result = Ok(());
        while !stepper.finished() && result.is_ok() {
            result = stepper.step(&mut f);
        }
        assert!(matches!(
            result,
            Err(Error::StepFailure {
                kind: FailureKind::MaxStepsExceeded,
                ..
            })
        ));
    }

    #[test]
    fn overflowing_state_shrinks_the_step() {
        // y = 1e308 (1 + t) overflows near t = 0.7977 while the error estimate stays zero
        let settings = OdeSettings {
            max_steps: 10_000,
            ..OdeSettings::default()
        };
        let mut stepper = Dopri5::new(0.0, 1.0, DVector::from_vec(vec![1e308]), &settings).unwrap();
        let mut f = |_t: f64, _y: &DVector<f64>| -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![1e308]))
        };
        let mut result = Ok(());
        while !stepper.finished() && result.is_ok() {
            result = stepper.step(&mut f);
        }
        match result {
            Err(Error::StepFailure {
                t,
                kind: FailureKind::NotFinite,
            }) => assert!(t > 0.7 && t < 0.8, "failed at t = {t}"),
            other => panic!("expected a NotFinite failure, got {other:?}"),
        }
    }
}
