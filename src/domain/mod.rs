//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - observations and extracted TOAs (`Observation`, `Toa`)
//! - committed fit records (`TimingSolution`, `Residuals`, `SolutionNotes`)
//! - filter verdicts and cycle bookkeeping (`FilterDecision`, `CycleStatus`, `CycleState`)

pub mod types;

pub use types::*;
