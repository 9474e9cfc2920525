use std::cell::OnceCell;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::care::{solve_care, SignSettings};
use super::system::{
    check_shape, solve_r, CostModel, CostWeights, Horizon, LinearModel, LinearSystem,
};
use crate::error::Result;
use crate::ode::{OdeSettings, Rodas4, Stepper};
use crate::trajectory::Trajectory;
use crate::utils::symmetrize;

/// `P(tb)` from the algebraic Riccati equation at the frozen system
/// `A(tb), B(tb), Q(tb), R(tb)`.
pub fn terminal_value(
    system: &LinearSystem,
    cost: &CostWeights,
    tb: f64,
    settings: &SignSettings,
) -> Result<DMatrix<f64>> {
    solve_care(&system.a(tb)?, &system.b(tb)?, &cost.q(tb)?, &cost.r(tb)?, settings)
}

/// `dP/dt = P B R^{-1} B^T P - A^T P - P A - Q`, symmetrized.
fn riccati_rhs(
    system: &LinearSystem,
    cost: &CostWeights,
    t: f64,
    p: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    let a = system.a(t)?;
    let b = system.b(t)?;
    let g = &b * solve_r(&cost.r(t)?, &b.transpose())?;
    let dp = p * g * p - a.transpose() * p - p * a - cost.q(t)?;
    Ok(symmetrize(&dp))
}

/// Integrates the differential Riccati equation from `P(tb) = pb` back to
/// `ta`.
///
/// The solve runs forward in `s = -t` on the stiff stepper with `vec(P)`
/// (column-major) as state. The returned trajectory has the single field
/// `"P"`, with a knot at `tb` and one at every accepted step.
pub fn solve_cdre(
    system: &LinearSystem,
    cost: &CostWeights,
    horizon: Horizon,
    pb: &DMatrix<f64>,
    settings: &OdeSettings,
) -> Result<Trajectory> {
    let n = system.n();
    check_shape("Pb", pb, n, n)?;
    let (ta, tb) = (horizon.ta(), horizon.tb());

    let mut rhs = |s: f64, y: &DVector<f64>| -> Result<DVector<f64>> {
        let p = DMatrix::from_column_slice(n, n, y.as_slice());
        let dp = -riccati_rhs(system, cost, -s, &p)?;
        Ok(DVector::from_column_slice(dp.as_slice()))
    };

    let pb = symmetrize(pb);
    let mut riccati = Trajectory::new(&["P"]);
    riccati.add_point(tb, &[("P", pb.clone())])?;

    let mut stepper = Rodas4::new(-tb, -ta, DVector::from_column_slice(pb.as_slice()), settings)?;
    let mut steps = 0;
    while !stepper.finished() {
        stepper.step(&mut rhs)?;
        steps += 1;
        let p = DMatrix::from_column_slice(n, n, stepper.y().as_slice());
        riccati.add_point(-stepper.t(), &[("P", symmetrize(&p))])?;
    }
    riccati.build()?;
    debug!(steps, ta, tb, "riccati solve done");
    Ok(riccati)
}

/// Differential Riccati problem over a horizon, solved once on first access.
///
/// Without an explicit terminal value, `P(tb)` is the algebraic Riccati
/// solution at `tb`.
#[derive(Debug, Clone)]
pub struct Cdre {
    system: LinearSystem,
    cost: CostWeights,
    horizon: Horizon,
    pb: Option<DMatrix<f64>>,
    ode: OdeSettings,
    sign: SignSettings,
    riccati: OnceCell<Trajectory>,
}

impl Cdre {
    pub fn new(horizon: Horizon, system: LinearSystem, cost: CostWeights) -> Result<Cdre> {
        cost.check_dims(system.n(), system.m(), horizon.tb())?;
        Ok(Cdre {
            system,
            cost,
            horizon,
            pb: None,
            ode: OdeSettings::default(),
            sign: SignSettings::default(),
            riccati: OnceCell::new(),
        })
    }

    pub fn with_terminal(mut self, pb: DMatrix<f64>) -> Result<Cdre> {
        check_shape("Pb", &pb, self.system.n(), self.system.n())?;
        self.pb = Some(pb);
        self.riccati = OnceCell::new();
        Ok(self)
    }

    pub fn with_ode_settings(mut self, settings: OdeSettings) -> Cdre {
        self.ode = settings;
        self.riccati = OnceCell::new();
        self
    }

    pub fn with_sign_settings(mut self, settings: SignSettings) -> Cdre {
        self.sign = settings;
        self.riccati = OnceCell::new();
        self
    }

    pub fn system(&self) -> &LinearSystem {
        &self.system
    }

    pub fn cost(&self) -> &CostWeights {
        &self.cost
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn ode_settings(&self) -> &OdeSettings {
        &self.ode
    }

    /// The `P(t)` trajectory.
    pub fn riccati(&self) -> Result<&Trajectory> {
        if let Some(riccati) = self.riccati.get() {
            return Ok(riccati);
        }
        let pb = match &self.pb {
            Some(pb) => pb.clone(),
            None => terminal_value(&self.system, &self.cost, self.horizon.tb(), &self.sign)?,
        };
        let riccati = solve_cdre(&self.system, &self.cost, self.horizon, &pb, &self.ode)?;
        Ok(self.riccati.get_or_init(|| riccati))
    }

    pub fn p(&self, t: f64) -> Result<DMatrix<f64>> {
        self.riccati()?.query("P", t)
    }
}
