use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::trajectory::Trajectory;

/// Time-varying matrix, e.g. `|t| gain.query("K", t)`.
pub type Schedule<'a> = Box<dyn Fn(f64) -> Result<DMatrix<f64>> + 'a>;

/// Feedback law `u = u_ref(t) - K(t) (x - x_ref(t)) - C(t)` around a
/// reference trajectory with fields `"x"` and `"u"`.
///
/// A missing gain or feedforward counts as zero.
pub struct Controller<'a> {
    reference: &'a Trajectory,
    gain: Option<Schedule<'a>>,
    feedforward: Option<Schedule<'a>>,
}

impl<'a> Controller<'a> {
    pub fn new(reference: &'a Trajectory) -> Controller<'a> {
        Controller {
            reference,
            gain: None,
            feedforward: None,
        }
    }

    pub fn with_gain(mut self, gain: impl Fn(f64) -> Result<DMatrix<f64>> + 'a) -> Controller<'a> {
        self.gain = Some(Box::new(gain));
        self
    }

    pub fn with_feedforward(
        mut self,
        feedforward: impl Fn(f64) -> Result<DMatrix<f64>> + 'a,
    ) -> Controller<'a> {
        self.feedforward = Some(Box::new(feedforward));
        self
    }

    pub fn evaluate(&self, t: f64, x: &DVector<f64>) -> Result<DVector<f64>> {
        let x_ref = self.reference.query_vector("x", t)?;
        let mut u = self.reference.query_vector("u", t)?;
        if x.len() != x_ref.len() {
            return Err(Error::shape(format!(
                "state has length {}, reference {}",
                x.len(),
                x_ref.len()
            )));
        }
        if let Some(gain) = &self.gain {
            let k = gain(t)?;
            if k.shape() != (u.len(), x.len()) {
                return Err(Error::shape(format!(
                    "gain must be {}x{}, got {}x{}",
                    u.len(),
                    x.len(),
                    k.nrows(),
                    k.ncols()
                )));
            }
            u -= k * (x - x_ref);
        }
        if let Some(feedforward) = &self.feedforward {
            let c = feedforward(t)?;
            if c.shape() != (u.len(), 1) {
                return Err(Error::shape(format!(
                    "feedforward must be {}x1, got {}x{}",
                    u.len(),
                    c.nrows(),
                    c.ncols()
                )));
            }
            u -= c.column(0);
        }
        Ok(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::column;
    use nalgebra::{dmatrix, dvector};

    fn reference() -> Trajectory {
        let mut reference = Trajectory::new(&["x", "u"]);
        for t in [0.0, 1.0, 2.0] {
            reference
                .add_point(t, &[("x", column(&dvector![t, 0.0])), ("u", column(&dvector![1.0]))])
                .unwrap();
        }
        reference.build().unwrap();
        reference
    }

    #[test]
    fn reference_only() {
        let reference = reference();
        let controller = Controller::new(&reference);
        let u = controller.evaluate(0.5, &dvector![5.0, 5.0]).unwrap();
        approx::assert_abs_diff_eq!(u, dvector![1.0], epsilon = 1e-12);
    }

    #[test]
    fn gain_and_feedforward() {
        let reference = reference();
        let controller = Controller::new(&reference)
            .with_gain(|_| Ok(dmatrix![1.0, 2.0]))
            .with_feedforward(|t| Ok(dmatrix![t]));
        // u = 1 - [1 2] ([2, 1] - [1, 0]) - 1
        let u = controller.evaluate(1.0, &dvector![2.0, 1.0]).unwrap();
        approx::assert_abs_diff_eq!(u, dvector![-3.0], epsilon = 1e-12);
    }

    #[test]
    fn wrong_gain_shape_is_an_error() {
        let reference = reference();
        let controller = Controller::new(&reference).with_gain(|_| Ok(DMatrix::zeros(2, 2)));
        assert!(matches!(
            controller.evaluate(1.0, &dvector![0.0, 0.0]),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn outside_reference_is_an_error() {
        let reference = reference();
        let controller = Controller::new(&reference);
        assert!(matches!(
            controller.evaluate(3.0, &dvector![0.0, 0.0]),
            Err(Error::OutOfDomain { .. })
        ));
    }
}
