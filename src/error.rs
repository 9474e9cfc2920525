use thiserror::Error;

/// Why an integrator gave up on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Error estimate or state became NaN / Inf.
    NotFinite,
    /// Step size shrank below the allowed minimum.
    StepTooSmall,
    /// More steps than `OdeSettings::max_steps`.
    MaxStepsExceeded,
    /// `I/(h gamma) - J` could not be factored.
    SingularJacobian,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NotFinite => write!(f, "state or error estimate is not finite"),
            FailureKind::StepTooSmall => write!(f, "step size below minimum"),
            FailureKind::MaxStepsExceeded => write!(f, "maximum number of steps exceeded"),
            FailureKind::SingularJacobian => write!(f, "iteration matrix is singular"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("shape mismatch: {what}")]
    Shape { what: String },

    #[error("no unique stabilizing solution: {what}")]
    SingularSubspace { what: &'static str },

    #[error("integration failed at t = {t}: {kind}")]
    StepFailure { t: f64, kind: FailureKind },

    #[error("t = {t} outside trajectory domain [{tmin}, {tmax}]")]
    OutOfDomain { t: f64, tmin: f64, tmax: f64 },

    #[error("trajectory queried before build()")]
    NotBuilt,

    #[error("trajectory has no field `{0}`")]
    UnknownField(String),

    #[error("sample is missing field `{0}`")]
    MissingField(String),

    #[error("trajectory is built and no longer accepts points")]
    Frozen,

    #[error("trajectory has no samples")]
    Empty,

    #[error("invalid argument: {what}")]
    InvalidArg { what: String },
}

impl Error {
    pub(crate) fn shape(what: impl Into<String>) -> Error {
        Error::Shape { what: what.into() }
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Error {
        Error::InvalidArg { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
