//! Adaptive ODE steppers over `DVector<f64>`.
//!
//! [`Rodas4`] is the stiff (Rosenbrock) stepper the backward Riccati and
//! costate solves run on, [`Dopri5`] the explicit one behind the default
//! [`AdaptiveIntegrator`]. Both advance one accepted step per call to
//! [`Stepper::step`], never pass the final time, and report failure as
//! [`Error::StepFailure`] instead of stopping short.

mod dopri5;
mod integrate;
mod rodas4;

pub use dopri5::Dopri5;
pub use integrate::{AdaptiveIntegrator, ForwardIntegrator, Integration};
pub use rodas4::Rodas4;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, FailureKind, Result};

/// Step-size control settings shared by all steppers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeSettings {
    /// Absolute error tolerance
    pub abs_tol: f64,
    /// Relative error tolerance
    pub rel_tol: f64,
    /// Safety factor of the step-size controller
    pub safety: f64,
    /// Smallest step-size change factor
    pub min_factor: f64,
    /// Largest step-size change factor
    pub max_factor: f64,
    /// Steps below this size are a failure
    pub min_step: f64,
    /// Optional cap on the step size
    pub max_step: Option<f64>,
    /// Accepted plus rejected steps allowed per solve
    pub max_steps: usize,
}

impl Default for OdeSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-10,
            rel_tol: 1e-8,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 10.0,
            min_step: 1e-12,
            max_step: None,
            max_steps: 100_000,
        }
    }
}

impl OdeSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.abs_tol > 0.0 && self.rel_tol >= 0.0) {
            return Err(Error::invalid("tolerances must be positive"));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(Error::invalid("safety factor must lie in (0, 1]"));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0 && self.max_factor > 1.0) {
            return Err(Error::invalid("need 0 < min_factor < 1 < max_factor"));
        }
        if !(self.min_step >= 0.0) {
            return Err(Error::invalid("min_step must be non-negative"));
        }
        if let Some(max_step) = self.max_step {
            if !(max_step > 0.0) {
                return Err(Error::invalid("max_step must be positive"));
            }
        }
        Ok(())
    }
}

/// One-step-at-a-time integrator from `t0` towards `tf` (either direction).
pub trait Stepper {
    /// Current independent variable.
    fn t(&self) -> f64;

    /// Current state.
    fn y(&self) -> &DVector<f64>;

    /// `true` once `t() == tf`.
    fn finished(&self) -> bool;

    /// Replace the current state, e.g. after a discrete correction.
    fn set_state(&mut self, y: DVector<f64>);

    /// Take one accepted step. A no-op once finished.
    fn step<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>> + ?Sized;
}

/// State and step-size bookkeeping common to both steppers.
#[derive(Debug, Clone)]
struct StepState {
    t: f64,
    tf: f64,
    y: DVector<f64>,
    /// Next step size, `None` until the first step picks one.
    h: Option<f64>,
    attempts: usize,
    settings: OdeSettings,
}

impl StepState {
    fn new(t0: f64, tf: f64, y0: DVector<f64>, settings: &OdeSettings) -> Result<StepState> {
        settings.validate()?;
        if !(t0.is_finite() && tf.is_finite()) {
            return Err(Error::invalid("integration limits must be finite"));
        }
        Ok(StepState {
            t: t0,
            tf,
            y: y0,
            h: None,
            attempts: 0,
            settings: settings.clone(),
        })
    }

    fn direction(&self) -> f64 {
        if self.tf >= self.t {
            1.0
        } else {
            -1.0
        }
    }

    fn finished(&self) -> bool {
        self.t == self.tf
    }

    /// Clip `h` to `max_step` and to the distance left.
    fn clip(&self, h: f64) -> f64 {
        let mut size = h.abs();
        if let Some(max_step) = self.settings.max_step {
            size = size.min(max_step);
        }
        size = size.min((self.tf - self.t).abs());
        size * self.direction()
    }

    fn count_attempt(&mut self) -> Result<()> {
        self.attempts += 1;
        if self.attempts > self.settings.max_steps {
            return Err(self.failure(FailureKind::MaxStepsExceeded));
        }
        Ok(())
    }

    fn failure(&self, kind: FailureKind) -> Error {
        Error::StepFailure { t: self.t, kind }
    }

    fn too_small(&self, h: f64) -> bool {
        h.abs() < self.settings.min_step.max(16.0 * f64::EPSILON * self.t.abs())
    }

    /// Move to `t + h`, landing exactly on `tf` for the last step.
    fn advance(&mut self, h: f64, y: DVector<f64>) {
        let remaining = (self.tf - self.t).abs();
        self.t = if h.abs() >= remaining { self.tf } else { self.t + h };
        self.y = y;
    }
}

/// RMS of `err` scaled by `abs_tol + rel_tol * max(|y|, |y_new|)`.
fn error_norm(
    err: &DVector<f64>,
    y: &DVector<f64>,
    y_new: &DVector<f64>,
    settings: &OdeSettings,
) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    let sum: f64 = err
        .iter()
        .zip(y.iter().zip(y_new.iter()))
        .map(|(e, (a, b))| {
            let scale = settings.abs_tol + settings.rel_tol * a.abs().max(b.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / err.len() as f64).sqrt()
}

/// Step-size change factor after a step with scaled error `err`.
fn step_factor(err: f64, order: usize, settings: &OdeSettings) -> f64 {
    if err == 0.0 {
        return settings.max_factor;
    }
    let factor = settings.safety * err.powf(-1.0 / (order as f64 + 1.0));
    factor.clamp(settings.min_factor, settings.max_factor)
}

/// Starting step size (Hairer, Norsett & Wanner, Solving ODEs I, II.4).
fn initial_step<F>(f: &mut F, state: &StepState, f0: &DVector<f64>, order: usize) -> Result<f64>
where
    F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>> + ?Sized,
{
    let settings = &state.settings;
    let span = (state.tf - state.t).abs();
    let scaled_norm = |v: &DVector<f64>| {
        let zero = DVector::zeros(v.len());
        error_norm(v, &state.y, &zero, settings)
    };

    let d0 = scaled_norm(&state.y);
    let d1 = scaled_norm(f0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
    let h0 = h0.min(span);

    let y1 = &state.y + f0 * (h0 * state.direction());
    let f1 = f(state.t + h0 * state.direction(), &y1)?;
    let d2 = scaled_norm(&(f1 - f0)) / h0;

    let dmax = d1.max(d2);
    let h1 = if dmax <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / dmax).powf(1.0 / (order as f64 + 1.0))
    };
    Ok(state.clip((100.0 * h0).min(h1)))
}

fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}
