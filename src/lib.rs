//! `psrtime` library crate.
//!
//! An incremental timing-fit engine: each cycle takes the next batch of
//! pulsar observations, filters outlier TOAs, decides which model parameters
//! the data can support, refits the timing model and commits a new solution.
//!
//! The binary (`psrtime`) is a thin wrapper so the engine can be driven and
//! tested without spawning processes.

pub mod app;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod filter;
pub mod fit;
pub mod io;
pub mod logging;
pub mod math;
pub mod models;
pub mod monitor;
pub mod report;
pub mod sim;
