use std::cell::OnceCell;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::lq::Lq;
use super::policy::Policy;
use super::system::{check_shape, CostModel, CostWeights, LinearModel};
use crate::error::{Error, Result};
use crate::ode::{AdaptiveIntegrator, ForwardIntegrator};
use crate::trajectory::{column, Trajectory};

/// Descent direction of an outer trajectory optimizer: the closed loop
/// `dx' = A dx + B du` under the LQ policy around a zero nominal, started
/// from `dx0` at `ta`.
///
/// The direction trajectory has the column fields `"x"` and `"u"` and is
/// computed once, on first access.
pub struct DescentDirection {
    lq: Lq,
    dx0: DVector<f64>,
    integrator: Box<dyn ForwardIntegrator>,
    direction: OnceCell<Trajectory>,
}

impl DescentDirection {
    /// Zero initial perturbation, [`AdaptiveIntegrator`] with the solver's
    /// ODE settings.
    pub fn new(lq: Lq) -> DescentDirection {
        let n = lq.lqr().cdre().system().n();
        let integrator = AdaptiveIntegrator::new(lq.lqr().cdre().ode_settings().clone());
        DescentDirection {
            lq,
            dx0: DVector::zeros(n),
            integrator: Box::new(integrator),
            direction: OnceCell::new(),
        }
    }

    pub fn with_initial(mut self, dx0: DVector<f64>) -> Result<DescentDirection> {
        let n = self.lq.lqr().cdre().system().n();
        if dx0.len() != n {
            return Err(Error::shape(format!("dx0 must have length {n}, got {}", dx0.len())));
        }
        self.dx0 = dx0;
        self.direction = OnceCell::new();
        Ok(self)
    }

    /// Integrate the closed loop with `integrator` instead, e.g. the outer
    /// optimizer's own simulator.
    pub fn with_integrator(
        mut self,
        integrator: impl ForwardIntegrator + 'static,
    ) -> DescentDirection {
        self.integrator = Box::new(integrator);
        self.direction = OnceCell::new();
        self
    }

    pub fn lq(&self) -> &Lq {
        &self.lq
    }

    pub fn initial(&self) -> &DVector<f64> {
        &self.dx0
    }

    /// The `(x, u)` direction trajectory.
    pub fn direction(&self) -> Result<&Trajectory> {
        if let Some(direction) = self.direction.get() {
            return Ok(direction);
        }
        let direction = self.integrate()?;
        Ok(self.direction.get_or_init(|| direction))
    }

    fn integrate(&self) -> Result<Trajectory> {
        let cdre = self.lq.lqr().cdre();
        let system = cdre.system();
        let horizon = cdre.horizon();

        let reference = Policy::zero_reference(horizon, system.n(), system.m())?;
        let policy = self.lq.policy(reference)?;
        let controller = policy.controller();

        let mut closed_loop = |t: f64, x: &DVector<f64>| -> Result<DVector<f64>> {
            let u = controller.evaluate(t, x)?;
            Ok(system.a(t)? * x + system.b(t)? * u)
        };
        let run = self
            .integrator
            .integrate(&mut closed_loop, &self.dx0, horizon.ta(), horizon.tb())?;
        if run.times.len() != run.states.len() {
            return Err(Error::shape(format!(
                "integrator returned {} times but {} states",
                run.times.len(),
                run.states.len()
            )));
        }

        let mut direction = Trajectory::new(&["x", "u"]);
        for (&t, x) in run.times.iter().zip(run.states.iter()) {
            let u = controller.evaluate(t, x)?;
            direction.add_point(t, &[("x", column(x)), ("u", column(&u))])?;
        }
        direction.build()?;
        debug!(knots = run.times.len(), events = run.events.len(), "descent direction done");
        Ok(direction)
    }

    pub fn x(&self, t: f64) -> Result<DVector<f64>> {
        self.direction()?.query_vector("x", t)
    }

    pub fn u(&self, t: f64) -> Result<DVector<f64>> {
        self.direction()?.query_vector("u", t)
    }

    /// Integral of `x^T Q x + u^T R u` over the knots (trapezoid rule) plus
    /// the terminal term `x(tb)^T pf x(tb)`.
    pub fn cost(&self, weights: &CostWeights, pf: &DMatrix<f64>) -> Result<f64> {
        let direction = self.direction()?;
        let n = self.dx0.len();
        check_shape("Pf", pf, n, n)?;

        let mut running = Vec::new();
        for ((t, x), (_, u)) in direction.samples("x")?.zip(direction.samples("u")?) {
            let stage = (x.transpose() * weights.q(t)? * x)[(0, 0)]
                + (u.transpose() * weights.r(t)? * u)[(0, 0)];
            running.push((t, stage));
        }
        let integral: f64 = running
            .windows(2)
            .map(|w| 0.5 * (w[1].0 - w[0].0) * (w[0].1 + w[1].1))
            .sum();

        let xf = direction.query("x", direction.tmax()?)?;
        let terminal = (xf.transpose() * pf * &xf)[(0, 0)];
        Ok(integral + terminal)
    }
}

impl std::fmt::Debug for DescentDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescentDirection")
            .field("lq", &self.lq)
            .field("dx0", &self.dx0)
            .finish_non_exhaustive()
    }
}
