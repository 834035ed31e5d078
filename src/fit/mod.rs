//! Timing fits.
//!
//! Responsibilities:
//!
//! - Gauss–Newton WLS and seeded MCMC refinement (`fitter`, `mcmc`)
//! - cluster-folding fallback for poorly converging data (`clustering`)
//! - span-driven parameter candidacy and F-test admission (`admission`)

pub mod admission;
pub mod clustering;
pub mod fitter;
pub mod mcmc;

pub use admission::*;
pub use clustering::*;
pub use fitter::*;
pub use mcmc::McmcOptions;
