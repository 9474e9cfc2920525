use std::cell::OnceCell;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::lqr::Lqr;
use super::policy::Policy;
use super::system::{solve_r, CostModel, CostWeights, Horizon, LinearModel, LinearSystem};
use crate::error::{Error, Result};
use crate::ode::{OdeSettings, Rodas4, Stepper};
use crate::trajectory::{column, Trajectory};

type VectorFn = Rc<dyn Fn(f64) -> Result<DVector<f64>>>;

/// Linear cost terms `q(t)^T x + r(t)^T u` and the terminal gradient `qf`.
#[derive(Clone)]
pub struct AffineCost {
    q: VectorFn,
    r: VectorFn,
    qf: DVector<f64>,
}

impl AffineCost {
    pub fn new<Q, R>(q: Q, r: R, qf: DVector<f64>) -> AffineCost
    where
        Q: Fn(f64) -> DVector<f64> + 'static,
        R: Fn(f64) -> DVector<f64> + 'static,
    {
        AffineCost::fallible(move |t| Ok(q(t)), move |t| Ok(r(t)), qf)
    }

    /// Terms that may fail to evaluate, e.g. queries of another trajectory.
    pub fn fallible<Q, R>(q: Q, r: R, qf: DVector<f64>) -> AffineCost
    where
        Q: Fn(f64) -> Result<DVector<f64>> + 'static,
        R: Fn(f64) -> Result<DVector<f64>> + 'static,
    {
        AffineCost {
            q: Rc::new(q),
            r: Rc::new(r),
            qf,
        }
    }

    pub fn zero(n: usize, m: usize) -> AffineCost {
        AffineCost::new(move |_| DVector::zeros(n), move |_| DVector::zeros(m), DVector::zeros(n))
    }

    pub fn q(&self, t: f64) -> Result<DVector<f64>> {
        (self.q)(t)
    }

    pub fn r(&self, t: f64) -> Result<DVector<f64>> {
        (self.r)(t)
    }

    pub fn qf(&self) -> &DVector<f64> {
        &self.qf
    }

    pub fn check_dims(&self, n: usize, m: usize, t: f64) -> Result<()> {
        let check = |what: &str, len: usize, expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(Error::shape(format!("{what} must have length {expected}, got {len}")))
            }
        };
        check("q", self.q(t)?.len(), n)?;
        check("r", self.r(t)?.len(), m)?;
        check("qf", self.qf.len(), n)
    }
}

impl std::fmt::Debug for AffineCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffineCost").field("qf", &self.qf).finish_non_exhaustive()
    }
}

/// Additive costate correction at an event time.
#[derive(Debug, Clone, PartialEq)]
pub struct Jump {
    pub t: f64,
    pub delta: DVector<f64>,
}

impl Jump {
    pub fn new(t: f64, delta: DVector<f64>) -> Jump {
        Jump { t, delta }
    }
}

/// Jumps ordered by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JumpSet {
    jumps: Vec<Jump>,
}

impl JumpSet {
    pub fn new(mut jumps: Vec<Jump>) -> JumpSet {
        jumps.sort_by(|a, b| a.t.total_cmp(&b.t));
        JumpSet { jumps }
    }

    pub fn push(&mut self, jump: Jump) {
        let idx = self.jumps.partition_point(|j| j.t <= jump.t);
        self.jumps.insert(idx, jump);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Jump> {
        self.jumps.iter()
    }

    pub fn len(&self) -> usize {
        self.jumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jumps.is_empty()
    }

    /// Every jump strictly inside the horizon with an `n`-vector delta.
    pub fn validate(&self, horizon: Horizon, n: usize) -> Result<()> {
        for jump in &self.jumps {
            if !horizon.contains_strictly(jump.t) {
                return Err(Error::invalid(format!(
                    "jump at t = {} is not inside ({}, {})",
                    jump.t,
                    horizon.ta(),
                    horizon.tb()
                )));
            }
            if jump.delta.len() != n {
                return Err(Error::shape(format!(
                    "jump delta must have length {n}, got {}",
                    jump.delta.len()
                )));
            }
        }
        Ok(())
    }
}

/// How a jump changes the costate in the step that crosses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JumpRule {
    /// `b += delta * (t_curr - t_prev)`, scaled by the (negative) length of
    /// the backward step.
    #[default]
    StepScaled,
    /// `b += delta`
    Instantaneous,
}

impl JumpRule {
    fn apply(self, b: &mut DVector<f64>, delta: &DVector<f64>, prev: f64, curr: f64) {
        match self {
            JumpRule::StepScaled => *b += delta * (curr - prev),
            JumpRule::Instantaneous => *b += delta,
        }
    }
}

/// Integrates the affine costate
/// `db/dt = K^T r - q - (A - B K)^T b`, `b(tb) = qf`, back to `ta`.
///
/// A jump at `tj` is applied once, in the backward step with
/// `t_prev > tj >= t_curr`, to the integrator state so it carries over to
/// the rest of the solve. The returned trajectory has the column field `"b"`.
pub fn solve_affine_costate(
    system: &LinearSystem,
    affine: &AffineCost,
    gain: &Trajectory,
    jumps: &JumpSet,
    rule: JumpRule,
    horizon: Horizon,
    settings: &OdeSettings,
) -> Result<Trajectory> {
    let (ta, tb) = (horizon.ta(), horizon.tb());
    jumps.validate(horizon, system.n())?;
    affine.check_dims(system.n(), system.m(), tb)?;

    let mut rhs = |s: f64, b: &DVector<f64>| -> Result<DVector<f64>> {
        let t = -s;
        let k = gain.query("K", t)?;
        let a = system.a(t)?;
        let closed_loop = a - system.b(t)? * &k;
        let dbdt = k.transpose() * affine.r(t)? - affine.q(t)? - closed_loop.transpose() * b;
        Ok(-dbdt)
    };

    let mut costate = Trajectory::with_interpolation(&["b"], gain.interpolation());
    costate.add_point(tb, &[("b", column(affine.qf()))])?;

    let mut stepper = Rodas4::new(-tb, -ta, affine.qf().clone(), settings)?;
    let mut steps = 0;
    while !stepper.finished() {
        let prev = -stepper.t();
        stepper.step(&mut rhs)?;
        steps += 1;
        let curr = -stepper.t();

        let mut b = stepper.y().clone();
        let mut jumped = false;
        for jump in jumps.iter().filter(|j| prev > j.t && j.t >= curr) {
            if jump.t == curr {
                warn!(t = jump.t, "jump lands on a step boundary");
            }
            rule.apply(&mut b, &jump.delta, prev, curr);
            jumped = true;
        }
        if jumped {
            stepper.set_state(b.clone());
        }
        costate.add_point(curr, &[("b", column(&b))])?;
    }
    costate.build()?;
    debug!(steps, jumps = jumps.len(), "costate solve done");
    Ok(costate)
}

/// Feedforward `C(t) = R(t)^{-1} (B(t)^T b(t) + r(t))` at the knots of
/// `costate`, column field `"C"`.
pub fn derive_feedforward(
    system: &LinearSystem,
    cost: &CostWeights,
    affine: &AffineCost,
    costate: &Trajectory,
) -> Result<Trajectory> {
    let mut feedforward = Trajectory::with_interpolation(&["C"], costate.interpolation());
    for (t, b) in costate.samples("b")? {
        let rhs = system.b(t)?.transpose() * b + column(&affine.r(t)?);
        feedforward.add_point(t, &[("C", solve_r(&cost.r(t)?, &rhs)?)])?;
    }
    feedforward.build()?;
    Ok(feedforward)
}

/// LQR extended with affine cost terms and costate jumps.
#[derive(Debug, Clone)]
pub struct Lq {
    lqr: Lqr,
    affine: AffineCost,
    jumps: JumpSet,
    rule: JumpRule,
    costate: OnceCell<Trajectory>,
    feedforward: OnceCell<Trajectory>,
}

impl Lq {
    pub fn new(lqr: Lqr, affine: AffineCost) -> Result<Lq> {
        let cdre = lqr.cdre();
        affine.check_dims(cdre.system().n(), cdre.system().m(), cdre.horizon().tb())?;
        Ok(Lq {
            lqr,
            affine,
            jumps: JumpSet::default(),
            rule: JumpRule::default(),
            costate: OnceCell::new(),
            feedforward: OnceCell::new(),
        })
    }

    pub fn with_jumps(mut self, jumps: JumpSet) -> Result<Lq> {
        let cdre = self.lqr.cdre();
        jumps.validate(cdre.horizon(), cdre.system().n())?;
        self.jumps = jumps;
        self.reset();
        Ok(self)
    }

    pub fn with_jump_rule(mut self, rule: JumpRule) -> Lq {
        self.rule = rule;
        self.reset();
        self
    }

    fn reset(&mut self) {
        self.costate = OnceCell::new();
        self.feedforward = OnceCell::new();
    }

    pub fn lqr(&self) -> &Lqr {
        &self.lqr
    }

    pub fn affine(&self) -> &AffineCost {
        &self.affine
    }

    pub fn jumps(&self) -> &JumpSet {
        &self.jumps
    }

    /// The `b(t)` trajectory.
    pub fn costate(&self) -> Result<&Trajectory> {
        if let Some(costate) = self.costate.get() {
            return Ok(costate);
        }
        let cdre = self.lqr.cdre();
        let costate = solve_affine_costate(
            cdre.system(),
            &self.affine,
            self.lqr.gain()?,
            &self.jumps,
            self.rule,
            cdre.horizon(),
            cdre.ode_settings(),
        )?;
        Ok(self.costate.get_or_init(|| costate))
    }

    /// The `C(t)` trajectory.
    pub fn feedforward(&self) -> Result<&Trajectory> {
        if let Some(feedforward) = self.feedforward.get() {
            return Ok(feedforward);
        }
        let cdre = self.lqr.cdre();
        let feedforward =
            derive_feedforward(cdre.system(), cdre.cost(), &self.affine, self.costate()?)?;
        Ok(self.feedforward.get_or_init(|| feedforward))
    }

    pub fn p(&self, t: f64) -> Result<DMatrix<f64>> {
        self.lqr.p(t)
    }

    pub fn k(&self, t: f64) -> Result<DMatrix<f64>> {
        self.lqr.k(t)
    }

    pub fn b(&self, t: f64) -> Result<DVector<f64>> {
        self.costate()?.query_vector("b", t)
    }

    pub fn c(&self, t: f64) -> Result<DVector<f64>> {
        self.feedforward()?.query_vector("C", t)
    }

    /// Feedback policy around `reference` (fields `"x"` and `"u"`).
    pub fn policy(&self, reference: Trajectory) -> Result<Policy> {
        Policy::new(self.lqr.gain()?.clone(), self.feedforward()?.clone(), reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::cdre::Cdre;
    use nalgebra::{dmatrix, dvector};

    fn horizon() -> Horizon {
        Horizon::new(0.0, 2.0).unwrap()
    }

    /// `A = 0`, `B = 0`: the costate only moves at jumps.
    fn frozen_lq(jumps: JumpSet, rule: JumpRule) -> Lq {
        let system = LinearSystem::time_invariant(dmatrix![0.0], dmatrix![0.0]).unwrap();
        let cdre = Cdre::new(horizon(), system, CostWeights::identity(1, 1))
            .unwrap()
            .with_terminal(dmatrix![1.0])
            .unwrap();
        let affine = AffineCost::new(|_| dvector![0.0], |_| dvector![0.0], dvector![1.0]);
        Lq::new(Lqr::new(cdre), affine)
            .unwrap()
            .with_jumps(jumps)
            .unwrap()
            .with_jump_rule(rule)
    }

    /// Costate knots just before and just after (in backward order) `tj`.
    fn around(costate: &Trajectory, tj: f64) -> ((f64, f64), (f64, f64)) {
        let knots: Vec<(f64, f64)> = costate
            .samples("b")
            .unwrap()
            .map(|(t, b)| (t, b[(0, 0)]))
            .collect();
        let after = knots.iter().position(|&(t, _)| t > tj).unwrap();
        (knots[after - 1], knots[after])
    }

    #[test]
    fn no_jumps_keeps_costate_constant() {
        let lq = frozen_lq(JumpSet::default(), JumpRule::StepScaled);
        for (_, b) in lq.costate().unwrap().samples("b").unwrap() {
            approx::assert_abs_diff_eq!(b[(0, 0)], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn step_scaled_jump() {
        let tj = 0.8;
        let lq = frozen_lq(JumpSet::new(vec![Jump::new(tj, dvector![3.0])]), JumpRule::StepScaled);
        let costate = lq.costate().unwrap();
        let ((curr, b_curr), (prev, b_prev)) = around(costate, tj);
        approx::assert_abs_diff_eq!(b_prev, 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(b_curr, 1.0 + 3.0 * (curr - prev), epsilon = 1e-12);
        // applied once, the correction persists down to ta
        approx::assert_abs_diff_eq!(lq.b(0.0).unwrap()[0], b_curr, epsilon = 1e-12);
    }

    #[test]
    fn instantaneous_jump() {
        let tj = 0.8;
        let jumps = JumpSet::new(vec![Jump::new(tj, dvector![3.0])]);
        let lq = frozen_lq(jumps, JumpRule::Instantaneous);
        let costate = lq.costate().unwrap();
        let ((_, b_curr), (_, b_prev)) = around(costate, tj);
        approx::assert_abs_diff_eq!(b_prev, 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(b_curr, 4.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(lq.b(0.0).unwrap()[0], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn rules_differ_by_step_length() {
        let jumps = JumpSet::new(vec![
            Jump::new(1.1, dvector![2.0]),
            Jump::new(0.4, dvector![-1.0]),
        ]);
        let scaled = frozen_lq(jumps.clone(), JumpRule::StepScaled);
        let instant = frozen_lq(jumps, JumpRule::Instantaneous);
        let b_scaled = scaled.b(0.0).unwrap()[0];
        let b_instant = instant.b(0.0).unwrap()[0];
        approx::assert_abs_diff_eq!(b_instant, 2.0, epsilon = 1e-12);
        assert!((b_scaled - b_instant).abs() > 1e-3);
    }

    #[test]
    fn jumps_outside_horizon_are_rejected() {
        let system = LinearSystem::time_invariant(dmatrix![0.0], dmatrix![1.0]).unwrap();
        let cdre = Cdre::new(horizon(), system, CostWeights::identity(1, 1)).unwrap();
        let lq = Lq::new(Lqr::new(cdre), AffineCost::zero(1, 1)).unwrap();
        for t in [0.0, 2.0, 2.5] {
            let result = lq.clone().with_jumps(JumpSet::new(vec![Jump::new(t, dvector![1.0])]));
            assert!(matches!(result, Err(Error::InvalidArg { .. })));
        }
    }

    #[test]
    fn affine_dims_are_checked() {
        let system =
            LinearSystem::time_invariant(dmatrix![0.0, 1.0; 0.0, 0.0], dmatrix![0.0; 1.0]).unwrap();
        let cdre = Cdre::new(horizon(), system, CostWeights::identity(2, 1)).unwrap();
        let result = Lq::new(Lqr::new(cdre), AffineCost::zero(2, 2));
        assert!(matches!(result, Err(Error::Shape { .. })));
    }

    #[test]
    fn constant_affine_terms_reach_steady_state() {
        // scalar x' = u, Q = R = 1, constant q and r: K = 1 and b settles
        // where 0 = K r - q - (A - B K) b, i.e. b = q - r
        let system = LinearSystem::time_invariant(dmatrix![0.0], dmatrix![1.0]).unwrap();
        let horizon = Horizon::new(0.0, 20.0).unwrap();
        let cdre = Cdre::new(horizon, system, CostWeights::identity(1, 1)).unwrap();
        let affine = AffineCost::new(|_| dvector![3.0], |_| dvector![1.0], dvector![0.0]);
        let lq = Lq::new(Lqr::new(cdre), affine).unwrap();
        approx::assert_abs_diff_eq!(lq.k(0.0).unwrap()[(0, 0)], 1.0, epsilon = 1e-8);
        approx::assert_abs_diff_eq!(lq.b(0.0).unwrap()[0], 2.0, epsilon = 1e-6);
        // C = R^{-1} (B^T b + r)
        approx::assert_abs_diff_eq!(lq.c(0.0).unwrap()[0], 3.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(lq.c(20.0).unwrap()[0], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn feedforward_knots_match_costate_knots() {
        let jumps = JumpSet::new(vec![Jump::new(1.0, dvector![1.0])]);
        let lq = frozen_lq(jumps, JumpRule::Instantaneous);
        assert_eq!(
            lq.costate().unwrap().times().unwrap(),
            lq.feedforward().unwrap().times().unwrap()
        );
        // B = 0 and r = 0, so C vanishes
        for (_, c) in lq.feedforward().unwrap().samples("C").unwrap() {
            approx::assert_abs_diff_eq!(c[(0, 0)], 0.0);
        }
    }

    #[test]
    fn jump_on_a_step_boundary_is_applied_once() {
        let plain = frozen_lq(JumpSet::default(), JumpRule::Instantaneous);
        let times = plain.costate().unwrap().times().unwrap().to_vec();
        let tj = times[times.len() / 2];
        assert!(tj > 0.0 && tj < 2.0);

        // same step sequence up to tj, so the jump lands exactly on a knot
        let jumps = JumpSet::new(vec![Jump::new(tj, dvector![3.0])]);
        let lq = frozen_lq(jumps, JumpRule::Instantaneous);
        let costate = lq.costate().unwrap();
        let ((curr, b_curr), (_, b_prev)) = around(costate, tj);
        assert_eq!(curr, tj);
        approx::assert_abs_diff_eq!(b_prev, 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(b_curr, 4.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(lq.b(0.0).unwrap()[0], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn riccati_step_failure_reaches_costate() {
        let system = LinearSystem::time_invariant(dmatrix![0.0], dmatrix![1.0]).unwrap();
        let cost = CostWeights::constant(dmatrix![-1.0], dmatrix![1.0]);
        let cdre = Cdre::new(Horizon::new(0.0, 3.0).unwrap(), system, cost)
            .unwrap()
            .with_terminal(dmatrix![0.0])
            .unwrap();
        let lq = Lq::new(Lqr::new(cdre), AffineCost::zero(1, 1)).unwrap();
        assert!(matches!(lq.costate(), Err(Error::StepFailure { .. })));
        assert!(matches!(lq.c(1.0), Err(Error::StepFailure { .. })));
    }
}
