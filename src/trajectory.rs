use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::interp::{CubicSpline, Interpolant, LinearInterp};

/// Relative slack on the domain ends, absorbs the drift of `t = -s`.
const DOMAIN_SLACK: f64 = 1e-12;

/// Interpolant used for every field of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// Natural cubic spline; needed wherever values get differentiated.
    #[default]
    Cubic,
    Linear,
}

#[derive(Debug, Clone)]
struct Built {
    tmin: f64,
    tmax: f64,
    times: Vec<f64>,
    knots: FxHashMap<String, Vec<DMatrix<f64>>>,
    interpolants: FxHashMap<String, Interpolant>,
}

/// Time-indexed samples of named matrix (or column vector) fields.
///
/// Points go in with [`Trajectory::add_point`] in any time order; once
/// [`Trajectory::build`] has sorted them and fitted one interpolant per field
/// the trajectory is frozen and only answers queries on `[tmin, tmax]`.
#[derive(Debug, Clone)]
pub struct Trajectory {
    fields: Vec<String>,
    interpolation: Interpolation,
    times: Vec<f64>,
    samples: FxHashMap<String, Vec<DMatrix<f64>>>,
    built: Option<Built>,
}

/// Column matrix holding `v`, the storage form of vector-valued fields.
pub fn column(v: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(v.len(), 1, v.as_slice())
}

impl Trajectory {
    pub fn new(fields: &[&str]) -> Trajectory {
        Trajectory::with_interpolation(fields, Interpolation::default())
    }

    pub fn with_interpolation(fields: &[&str], interpolation: Interpolation) -> Trajectory {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let samples = fields.iter().map(|f| (f.clone(), Vec::new())).collect();
        Trajectory {
            fields,
            interpolation,
            times: Vec::new(),
            samples,
            built: None,
        }
    }

    /// Record one sample of every declared field at time `t`.
    pub fn add_point(&mut self, t: f64, values: &[(&str, DMatrix<f64>)]) -> Result<()> {
        if self.built.is_some() {
            return Err(Error::Frozen);
        }
        if !t.is_finite() {
            return Err(Error::invalid(format!("sample time {t} is not finite")));
        }
        for (i, (name, _)) in values.iter().enumerate() {
            if !self.samples.contains_key(*name) {
                return Err(Error::UnknownField(name.to_string()));
            }
            if values[..i].iter().any(|(other, _)| other == name) {
                return Err(Error::invalid(format!("field `{name}` given twice")));
            }
        }
        for field in &self.fields {
            if !values.iter().any(|(name, _)| name == field) {
                return Err(Error::MissingField(field.clone()));
            }
        }
        // every shape is checked before anything is stored
        for (name, value) in values {
            if let Some(first) = self.samples[*name].first() {
                if first.shape() != value.shape() {
                    return Err(Error::shape(format!(
                        "field `{name}` expects {:?}, got {:?}",
                        first.shape(),
                        value.shape()
                    )));
                }
            }
        }
        for (name, value) in values {
            if let Some(column) = self.samples.get_mut(*name) {
                column.push(value.clone());
            }
        }
        self.times.push(t);
        Ok(())
    }

    /// Sort the samples and fit the interpolants. Freezes the trajectory.
    pub fn build(&mut self) -> Result<()> {
        if self.built.is_some() {
            return Ok(());
        }
        if self.times.is_empty() {
            return Err(Error::Empty);
        }

        let mut order: Vec<usize> = (0..self.times.len()).collect();
        // stable sort keeps insertion order among equal times
        order.sort_by(|&i, &j| self.times[i].total_cmp(&self.times[j]));
        // last inserted sample wins for repeated times
        let mut kept: Vec<usize> = Vec::with_capacity(order.len());
        for idx in order {
            let n = kept.len();
            if n > 0 && self.times[kept[n - 1]] == self.times[idx] {
                kept[n - 1] = idx;
            } else {
                kept.push(idx);
            }
        }

        let times: Vec<f64> = kept.iter().map(|&i| self.times[i]).collect();
        let mut knots = FxHashMap::default();
        let mut interpolants = FxHashMap::default();
        for field in &self.fields {
            let column = &self.samples[field];
            let values: Vec<DMatrix<f64>> = kept.iter().map(|&i| column[i].clone()).collect();
            let interpolant = match (values.len(), self.interpolation) {
                (1, _) => Interpolant::Constant(values[0].clone()),
                (2, _) | (_, Interpolation::Linear) => {
                    Interpolant::Linear(LinearInterp::new(times.clone(), values.clone())?)
                }
                (_, Interpolation::Cubic) => {
                    Interpolant::Cubic(CubicSpline::new(times.clone(), &values)?)
                }
            };
            interpolants.insert(field.clone(), interpolant);
            knots.insert(field.clone(), values);
        }

        self.built = Some(Built {
            tmin: times[0],
            tmax: times[times.len() - 1],
            times,
            knots,
            interpolants,
        });
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    fn built(&self) -> Result<&Built> {
        self.built.as_ref().ok_or(Error::NotBuilt)
    }

    fn clamp_to_domain(built: &Built, t: f64) -> Result<f64> {
        let slack = DOMAIN_SLACK * (built.tmax - built.tmin).max(1.0);
        if !(t >= built.tmin - slack && t <= built.tmax + slack) {
            return Err(Error::OutOfDomain {
                t,
                tmin: built.tmin,
                tmax: built.tmax,
            });
        }
        Ok(t.clamp(built.tmin, built.tmax))
    }

    fn interpolant(&self, field: &str) -> Result<(&Built, &Interpolant)> {
        let built = self.built()?;
        let interpolant = built
            .interpolants
            .get(field)
            .ok_or_else(|| Error::UnknownField(field.to_string()))?;
        Ok((built, interpolant))
    }

    /// Interpolated value of `field` at `t`.
    pub fn query(&self, field: &str, t: f64) -> Result<DMatrix<f64>> {
        let (built, interpolant) = self.interpolant(field)?;
        let t = Trajectory::clamp_to_domain(built, t)?;
        Ok(interpolant.eval(t))
    }

    /// Same as [`Trajectory::query`] for a column-vector field.
    pub fn query_vector(&self, field: &str, t: f64) -> Result<DVector<f64>> {
        let value = self.query(field, t)?;
        if value.ncols() != 1 {
            return Err(Error::shape(format!(
                "field `{field}` is {}x{}, not a column vector",
                value.nrows(),
                value.ncols()
            )));
        }
        Ok(DVector::from_column_slice(value.as_slice()))
    }

    /// Time derivative of the interpolant of `field` at `t`.
    pub fn derivative(&self, field: &str, t: f64) -> Result<DMatrix<f64>> {
        let (built, interpolant) = self.interpolant(field)?;
        let t = Trajectory::clamp_to_domain(built, t)?;
        Ok(interpolant.eval_derivative(t))
    }

    pub fn tmin(&self) -> Result<f64> {
        Ok(self.built()?.tmin)
    }

    pub fn tmax(&self) -> Result<f64> {
        Ok(self.built()?.tmax)
    }

    /// Sorted knot times.
    pub fn times(&self) -> Result<&[f64]> {
        Ok(&self.built()?.times)
    }

    /// Sorted `(t, value)` knots of `field`.
    pub fn samples(&self, field: &str) -> Result<impl Iterator<Item = (f64, &DMatrix<f64>)> + '_> {
        let built = self.built()?;
        let values = built
            .knots
            .get(field)
            .ok_or_else(|| Error::UnknownField(field.to_string()))?;
        Ok(built.times.iter().copied().zip(values.iter()))
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.as_str())
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// New trajectory over the same times with every sample multiplied by
    /// `factor`. Built if `self` is built.
    pub fn scale(&self, factor: f64) -> Result<Trajectory> {
        let names: Vec<&str> = self.fields().collect();
        let mut scaled = Trajectory::with_interpolation(&names, self.interpolation);
        for (i, &t) in self.times.iter().enumerate() {
            let values: Vec<(&str, DMatrix<f64>)> = names
                .iter()
                .map(|name| (*name, &self.samples[*name][i] * factor))
                .collect();
            scaled.add_point(t, &values)?;
        }
        if self.is_built() {
            scaled.build()?;
        }
        Ok(scaled)
    }
}
