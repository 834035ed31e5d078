//! Timing model representation and evaluation.
//!
//! - `parfile`: the line-oriented model text and its fittable parameters
//! - `phase`: phase/frequency/design-row evaluation and residuals

pub mod parfile;
pub mod phase;

pub use parfile::*;
pub use phase::{Evaluation, PhaseModel, assign_pulse_numbers, evaluate, prefit_residuals};
