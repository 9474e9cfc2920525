use std::cell::OnceCell;

use nalgebra::DMatrix;
use tracing::debug;

use super::cdre::Cdre;
use super::system::{solve_r, CostModel, CostWeights, LinearModel, LinearSystem};
use crate::error::Result;
use crate::trajectory::Trajectory;

/// Gain `K(t) = R(t)^{-1} B(t)^T P(t)` at the knots of `riccati`, field
/// `"K"`.
pub fn derive_gain(
    system: &LinearSystem,
    cost: &CostWeights,
    riccati: &Trajectory,
) -> Result<Trajectory> {
    let mut gain = Trajectory::with_interpolation(&["K"], riccati.interpolation());
    for (t, p) in riccati.samples("P")? {
        let bt = system.b(t)?.transpose();
        let k = solve_r(&cost.r(t)?, &(bt * p))?;
        gain.add_point(t, &[("K", k)])?;
    }
    gain.build()?;
    debug!(knots = gain.times()?.len(), "gain derived");
    Ok(gain)
}

/// Finite-horizon LQR: the Riccati solution plus its gain schedule.
#[derive(Debug, Clone)]
pub struct Lqr {
    cdre: Cdre,
    gain: OnceCell<Trajectory>,
}

impl Lqr {
    pub fn new(cdre: Cdre) -> Lqr {
        Lqr {
            cdre,
            gain: OnceCell::new(),
        }
    }

    pub fn cdre(&self) -> &Cdre {
        &self.cdre
    }

    pub fn riccati(&self) -> Result<&Trajectory> {
        self.cdre.riccati()
    }

    /// The `K(t)` trajectory, solving the Riccati equation first if needed.
    pub fn gain(&self) -> Result<&Trajectory> {
        if let Some(gain) = self.gain.get() {
            return Ok(gain);
        }
        let gain = derive_gain(self.cdre.system(), self.cdre.cost(), self.cdre.riccati()?)?;
        Ok(self.gain.get_or_init(|| gain))
    }

    pub fn p(&self, t: f64) -> Result<DMatrix<f64>> {
        self.cdre.p(t)
    }

    pub fn k(&self, t: f64) -> Result<DMatrix<f64>> {
        self.gain()?.query("K", t)
    }
}
