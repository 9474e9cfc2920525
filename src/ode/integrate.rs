use nalgebra::DVector;
use tracing::debug;

use super::{Dopri5, OdeSettings, Stepper};
use crate::error::{Error, Result};

/// Output of a forward integration: the accepted time grid, the state at
/// each time and any event times the integrator detected.
#[derive(Debug, Clone, Default)]
pub struct Integration {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
    pub events: Vec<f64>,
}

/// Forward integration of `x' = f(t, x)` from `x0` at `ta` to `tb`.
///
/// The descent direction only needs this seam, so an outer optimizer can
/// hand in its own simulator (with event detection) instead of
/// [`AdaptiveIntegrator`].
pub trait ForwardIntegrator {
    fn integrate(
        &self,
        f: &mut dyn FnMut(f64, &DVector<f64>) -> Result<DVector<f64>>,
        x0: &DVector<f64>,
        ta: f64,
        tb: f64,
    ) -> Result<Integration>;
}

/// Dormand-Prince integration recording every accepted step.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveIntegrator {
    pub settings: OdeSettings,
}

impl AdaptiveIntegrator {
    pub fn new(settings: OdeSettings) -> AdaptiveIntegrator {
        AdaptiveIntegrator { settings }
    }
}

impl ForwardIntegrator for AdaptiveIntegrator {
    fn integrate(
        &self,
        f: &mut dyn FnMut(f64, &DVector<f64>) -> Result<DVector<f64>>,
        x0: &DVector<f64>,
        ta: f64,
        tb: f64,
    ) -> Result<Integration> {
        if !(ta < tb) {
            return Err(Error::invalid(format!(
                "forward integration needs ta < tb, got [{ta}, {tb}]"
            )));
        }
        let mut stepper = Dopri5::new(ta, tb, x0.clone(), &self.settings)?;
        let mut out = Integration {
            times: vec![ta],
            states: vec![x0.clone()],
            events: Vec::new(),
        };
        while !stepper.finished() {
            stepper.step(f)?;
            out.times.push(stepper.t());
            out.states.push(stepper.y().clone());
        }
        debug!(samples = out.times.len(), ta, tb, "forward integration done");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_every_step() {
        let integrator = AdaptiveIntegrator::default();
        let x0 = DVector::from_vec(vec![1.0]);
        let out = integrator.integrate(&mut |_t, x| Ok(-x), &x0, 0.0, 2.0).unwrap();
        assert_eq!(out.times.len(), out.states.len());
        assert_eq!(out.times[0], 0.0);
        assert_eq!(*out.times.last().unwrap(), 2.0);
        assert!(out.times.windows(2).all(|w| w[0] < w[1]));
        assert!(out.events.is_empty());
        approx::assert_abs_diff_eq!(
            out.states.last().unwrap()[0],
            (-2.0_f64).exp(),
            epsilon = 1e-7
        );
    }

    #[test]
    fn rejects_reversed_horizon() {
        let integrator = AdaptiveIntegrator::default();
        let x0 = DVector::from_vec(vec![1.0]);
        let result = integrator.integrate(&mut |_t, x| Ok(x.clone()), &x0, 1.0, 0.0);
        assert!(matches!(result, Err(Error::InvalidArg { .. })));
    }

    #[test]
    fn propagates_rhs_errors() {
        let integrator = AdaptiveIntegrator::default();
        let x0 = DVector::from_vec(vec![1.0]);
        let result = integrator.integrate(&mut |_t, _x| Err(Error::NotBuilt), &x0, 0.0, 1.0);
        assert_eq!(result.unwrap_err(), Error::NotBuilt);
    }
}
