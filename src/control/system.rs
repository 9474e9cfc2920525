use std::rc::Rc;

use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// `(n, m)` from samples of `A` and `B`.
///
/// `A` must be square and share its row count with `B`.
pub fn validate_dims(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<(usize, usize)> {
    if !a.is_square() {
        return Err(Error::shape(format!("A must be square, got {}x{}", a.nrows(), a.ncols())));
    }
    if a.nrows() != b.nrows() {
        return Err(Error::shape(format!(
            "A has {} rows but B has {}",
            a.nrows(),
            b.nrows()
        )));
    }
    Ok((a.nrows(), b.ncols()))
}

pub(crate) fn check_shape(what: &str, m: &DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if m.shape() != (rows, cols) {
        return Err(Error::shape(format!(
            "{what} must be {rows}x{cols}, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    Ok(())
}

/// `R^{-1} rhs` through an LU factorization of `R`.
pub(crate) fn solve_r(r: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    r.clone()
        .lu()
        .solve(rhs)
        .ok_or(Error::SingularSubspace { what: "R is singular" })
}

/// Finite time interval `[ta, tb]` with `ta < tb`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizon {
    ta: f64,
    tb: f64,
}

impl Horizon {
    pub fn new(ta: f64, tb: f64) -> Result<Horizon> {
        if !(ta.is_finite() && tb.is_finite() && ta < tb) {
            return Err(Error::invalid(format!("horizon needs finite ta < tb, got [{ta}, {tb}]")));
        }
        Ok(Horizon { ta, tb })
    }

    pub fn ta(&self) -> f64 {
        self.ta
    }

    pub fn tb(&self) -> f64 {
        self.tb
    }

    pub fn span(&self) -> f64 {
        self.tb - self.ta
    }

    /// `ta < t < tb`
    pub fn contains_strictly(&self, t: f64) -> bool {
        self.ta < t && t < self.tb
    }
}

/// Time-varying linear dynamics `x' = A(t) x + B(t) u`.
///
/// Implement this to hand in a linearization about a nonlinear trajectory.
pub trait LinearModel {
    fn a(&self, t: f64) -> Result<DMatrix<f64>>;
    fn b(&self, t: f64) -> Result<DMatrix<f64>>;
}

/// Time-varying quadratic weights `x^T Q(t) x + u^T R(t) u`.
pub trait CostModel {
    fn q(&self, t: f64) -> Result<DMatrix<f64>>;
    fn r(&self, t: f64) -> Result<DMatrix<f64>>;
}

struct FnModel<A, B> {
    a: A,
    b: B,
}

impl<A, B> LinearModel for FnModel<A, B>
where
    A: Fn(f64) -> DMatrix<f64>,
    B: Fn(f64) -> DMatrix<f64>,
{
    fn a(&self, t: f64) -> Result<DMatrix<f64>> {
        Ok((self.a)(t))
    }

    fn b(&self, t: f64) -> Result<DMatrix<f64>> {
        Ok((self.b)(t))
    }
}

impl<Q, R> CostModel for FnModel<Q, R>
where
    Q: Fn(f64) -> DMatrix<f64>,
    R: Fn(f64) -> DMatrix<f64>,
{
    fn q(&self, t: f64) -> Result<DMatrix<f64>> {
        Ok((self.a)(t))
    }

    fn r(&self, t: f64) -> Result<DMatrix<f64>> {
        Ok((self.b)(t))
    }
}

/// A [`LinearModel`] with dimensions checked once at a sample time.
///
/// Cheap to clone, the model is shared.
#[derive(Clone)]
pub struct LinearSystem {
    model: Rc<dyn LinearModel>,
    n: usize,
    m: usize,
}

impl LinearSystem {
    /// Checks the shapes of `A(t_sample)` and `B(t_sample)` only; consistency
    /// over the rest of the horizon is up to the model.
    pub fn from_model(model: impl LinearModel + 'static, t_sample: f64) -> Result<LinearSystem> {
        let (n, m) = validate_dims(&model.a(t_sample)?, &model.b(t_sample)?)?;
        Ok(LinearSystem {
            model: Rc::new(model),
            n,
            m,
        })
    }

    pub fn new<A, B>(a: A, b: B, t_sample: f64) -> Result<LinearSystem>
    where
        A: Fn(f64) -> DMatrix<f64> + 'static,
        B: Fn(f64) -> DMatrix<f64> + 'static,
    {
        LinearSystem::from_model(FnModel { a, b }, t_sample)
    }

    pub fn time_invariant(a: DMatrix<f64>, b: DMatrix<f64>) -> Result<LinearSystem> {
        LinearSystem::new(move |_| a.clone(), move |_| b.clone(), 0.0)
    }

    /// State dimension
    pub fn n(&self) -> usize {
        self.n
    }

    /// Control dimension
    pub fn m(&self) -> usize {
        self.m
    }
}

impl LinearModel for LinearSystem {
    fn a(&self, t: f64) -> Result<DMatrix<f64>> {
        self.model.a(t)
    }

    fn b(&self, t: f64) -> Result<DMatrix<f64>> {
        self.model.b(t)
    }
}

impl std::fmt::Debug for LinearSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearSystem").field("n", &self.n).field("m", &self.m).finish()
    }
}

/// Shared [`CostModel`], `Q = I`, `R = I` unless given.
#[derive(Clone)]
pub struct CostWeights {
    model: Rc<dyn CostModel>,
}

impl CostWeights {
    pub fn from_model(model: impl CostModel + 'static) -> CostWeights {
        CostWeights { model: Rc::new(model) }
    }

    pub fn new<Q, R>(q: Q, r: R) -> CostWeights
    where
        Q: Fn(f64) -> DMatrix<f64> + 'static,
        R: Fn(f64) -> DMatrix<f64> + 'static,
    {
        CostWeights::from_model(FnModel { a: q, b: r })
    }

    pub fn constant(q: DMatrix<f64>, r: DMatrix<f64>) -> CostWeights {
        CostWeights::new(move |_| q.clone(), move |_| r.clone())
    }

    /// `Q = I_n`, `R = I_m`
    pub fn identity(n: usize, m: usize) -> CostWeights {
        CostWeights::constant(DMatrix::identity(n, n), DMatrix::identity(m, m))
    }

    pub fn for_system(system: &LinearSystem) -> CostWeights {
        CostWeights::identity(system.n(), system.m())
    }

    /// Shapes of `Q(t)` and `R(t)` against `(n, m)`.
    pub fn check_dims(&self, n: usize, m: usize, t: f64) -> Result<()> {
        check_shape("Q", &self.q(t)?, n, n)?;
        check_shape("R", &self.r(t)?, m, m)
    }
}

impl CostModel for CostWeights {
    fn q(&self, t: f64) -> Result<DMatrix<f64>> {
        self.model.q(t)
    }

    fn r(&self, t: f64) -> Result<DMatrix<f64>> {
        self.model.r(t)
    }
}

impl std::fmt::Debug for CostWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostWeights").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    #[test]
    fn dims_of_double_integrator() {
        let a = dmatrix![0.0, 1.0; 0.0, 0.0];
        let b = dmatrix![0.0; 1.0];
        assert_eq!(validate_dims(&a, &b).unwrap(), (2, 1));
    }

    #[test]
    fn non_square_a_is_rejected() {
        let a = DMatrix::<f64>::zeros(2, 3);
        let b = DMatrix::<f64>::zeros(2, 1);
        assert!(matches!(validate_dims(&a, &b), Err(Error::Shape { .. })));
    }

    #[test]
    fn row_mismatch_is_rejected() {
        let a = DMatrix::<f64>::zeros(3, 3);
        let b = DMatrix::<f64>::zeros(2, 1);
        assert!(matches!(validate_dims(&a, &b), Err(Error::Shape { .. })));
    }

    #[test]
    fn horizon_must_be_ordered() {
        assert!(Horizon::new(0.0, 1.0).is_ok());
        assert!(Horizon::new(1.0, 1.0).is_err());
        assert!(Horizon::new(0.0, f64::INFINITY).is_err());
        let horizon = Horizon::new(-1.0, 2.0).unwrap();
        assert!(horizon.contains_strictly(0.0));
        assert!(!horizon.contains_strictly(2.0));
        assert_eq!(horizon.span(), 3.0);
    }

    #[test]
    fn time_varying_system_is_sampled() {
        let system = LinearSystem::new(
            |t| DMatrix::from_element(3, 3, t),
            |_| DMatrix::zeros(3, 2),
            0.5,
        )
        .unwrap();
        assert_eq!((system.n(), system.m()), (3, 2));
        assert_eq!(system.a(2.0).unwrap()[(1, 1)], 2.0);
    }

    #[test]
    fn cost_shapes_are_checked() {
        let cost = CostWeights::identity(2, 1);
        assert!(cost.check_dims(2, 1, 0.0).is_ok());
        assert!(matches!(cost.check_dims(2, 2, 0.0), Err(Error::Shape { .. })));
    }

    #[test]
    fn singular_r_is_reported() {
        let r = DMatrix::<f64>::zeros(2, 2);
        let rhs = DMatrix::<f64>::identity(2, 2);
        assert!(matches!(solve_r(&r, &rhs), Err(Error::SingularSubspace { .. })));
    }
}
