//! Domain model for installation plans: phases, target servers, package
//! locators and the plan audit trail.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
