use nalgebra::{DMatrix, DVector};

use super::controller::Controller;
use super::system::Horizon;
use crate::error::{Error, Result};
use crate::trajectory::{Interpolation, Trajectory};

/// Gain `K(t)`, feedforward `C(t)` and the nominal trajectory they act
/// around, all built.
#[derive(Debug, Clone)]
pub struct Policy {
    gain: Trajectory,
    feedforward: Trajectory,
    reference: Trajectory,
}

fn require_fields(trajectory: &Trajectory, fields: &[&str]) -> Result<()> {
    if !trajectory.is_built() {
        return Err(Error::NotBuilt);
    }
    for field in fields {
        if !trajectory.fields().any(|f| f == *field) {
            return Err(Error::MissingField(field.to_string()));
        }
    }
    Ok(())
}

impl Policy {
    /// `gain` with field `"K"`, `feedforward` with `"C"`, `reference` with
    /// `"x"` and `"u"`.
    pub fn new(gain: Trajectory, feedforward: Trajectory, reference: Trajectory) -> Result<Policy> {
        require_fields(&gain, &["K"])?;
        require_fields(&feedforward, &["C"])?;
        require_fields(&reference, &["x", "u"])?;
        Ok(Policy {
            gain,
            feedforward,
            reference,
        })
    }

    /// Zero nominal over `horizon`: `x_ref = 0` (`n`), `u_ref = 0` (`m`).
    pub fn zero_reference(horizon: Horizon, n: usize, m: usize) -> Result<Trajectory> {
        let mut reference = Trajectory::with_interpolation(&["x", "u"], Interpolation::Linear);
        for t in [horizon.ta(), horizon.tb()] {
            reference.add_point(t, &[("x", DMatrix::zeros(n, 1)), ("u", DMatrix::zeros(m, 1))])?;
        }
        reference.build()?;
        Ok(reference)
    }

    pub fn gain(&self) -> &Trajectory {
        &self.gain
    }

    pub fn feedforward(&self) -> &Trajectory {
        &self.feedforward
    }

    pub fn reference(&self) -> &Trajectory {
        &self.reference
    }

    pub fn controller(&self) -> Controller<'_> {
        Controller::new(&self.reference)
            .with_gain(|t| self.gain.query("K", t))
            .with_feedforward(|t| self.feedforward.query("C", t))
    }

    /// `u_ref(t) - K(t) (x - x_ref(t)) - C(t)`
    pub fn evaluate(&self, t: f64, x: &DVector<f64>) -> Result<DVector<f64>> {
        self.controller().evaluate(t, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    fn constant(field: &str, value: DMatrix<f64>) -> Trajectory {
        let mut trajectory = Trajectory::new(&[field]);
        trajectory.add_point(0.0, &[(field, value.clone())]).unwrap();
        trajectory.add_point(1.0, &[(field, value)]).unwrap();
        trajectory.build().unwrap();
        trajectory
    }

    #[test]
    fn evaluates_feedback_law() {
        let horizon = Horizon::new(0.0, 1.0).unwrap();
        let policy = Policy::new(
            constant("K", dmatrix![2.0, 0.0]),
            constant("C", dmatrix![0.5]),
            Policy::zero_reference(horizon, 2, 1).unwrap(),
        )
        .unwrap();
        let u = policy.evaluate(0.3, &dvector![1.0, 4.0]).unwrap();
        approx::assert_abs_diff_eq!(u, dvector![-2.5], epsilon = 1e-12);
    }

    #[test]
    fn zero_reference_spans_horizon() {
        let reference = Policy::zero_reference(Horizon::new(-1.0, 3.0).unwrap(), 3, 2).unwrap();
        assert_eq!(reference.tmin().unwrap(), -1.0);
        assert_eq!(reference.tmax().unwrap(), 3.0);
        assert_eq!(reference.query_vector("x", 1.0).unwrap(), DVector::zeros(3));
        assert_eq!(reference.query_vector("u", 1.0).unwrap(), DVector::zeros(2));
    }

    #[test]
    fn fields_are_required() {
        let horizon = Horizon::new(0.0, 1.0).unwrap();
        let result = Policy::new(
            constant("C", dmatrix![0.5]),
            constant("C", dmatrix![0.5]),
            Policy::zero_reference(horizon, 2, 1).unwrap(),
        );
        assert_eq!(result.unwrap_err(), Error::MissingField("K".to_string()));

        let unbuilt = Trajectory::new(&["K"]);
        let result = Policy::new(
            unbuilt,
            constant("C", dmatrix![0.5]),
            Policy::zero_reference(horizon, 2, 1).unwrap(),
        );
        assert_eq!(result.unwrap_err(), Error::NotBuilt);
    }
}
