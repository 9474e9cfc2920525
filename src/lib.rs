pub mod control;
pub mod error;
pub mod ode;
pub mod trajectory;
pub mod utils;

pub use error::{Error, Result};
pub use trajectory::Trajectory;
