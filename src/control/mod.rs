//! Finite-horizon linear-quadratic control, solved backwards then applied
//! forwards.
//!
//! Each stage has a free function returning plain data and a lazily solved
//! wrapper that memoizes it:
//!
//! | stage | function | wrapper |
//! |---|---|---|
//! | terminal `P(tb)` | [`solve_care`] | [`Care`] |
//! | `P(t)` | [`solve_cdre`] | [`Cdre`] |
//! | `K(t)` | [`derive_gain`] | [`Lqr`] |
//! | `b(t)`, `C(t)` | [`solve_affine_costate`], [`derive_feedforward`] | [`Lq`] |
//! | `(x, u)` direction | | [`DescentDirection`] |

pub mod care;
pub mod cdre;
mod controller;
mod descent;
pub mod lq;
pub mod lqr;
mod policy;
mod system;

pub use care::{care_residual, solve_care, Care, SignSettings};
pub use cdre::{solve_cdre, terminal_value, Cdre};
pub use controller::{Controller, Schedule};
pub use descent::DescentDirection;
pub use lq::{derive_feedforward, solve_affine_costate, AffineCost, Jump, JumpRule, JumpSet, Lq};
pub use lqr::{derive_gain, Lqr};
pub use policy::Policy;
pub use system::{validate_dims, CostModel, CostWeights, Horizon, LinearModel, LinearSystem};
