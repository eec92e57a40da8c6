//! Progress reporting for installation plans
//!
//! This crate provides the [`ProgressSink`] interface used by the plan
//! engine and phase executors, and an event bus based implementation.

mod bus;
mod sink;
mod types;

pub use bus::EventBus;
pub use sink::{ProgressReporter, ProgressSink};
pub use types::*;
