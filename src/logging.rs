//! Tracing subscriber setup for the `psrtime` binary.
//!
//! Filter priority, highest first:
//!
//! 1. `PSRTIME_LOG` (e.g. `psrtime::filter=debug,info`)
//! 2. `RUST_LOG`
//! 3. `-v` (debug) / `-q` (warn)
//! 4. `info`
//!
//! Logs go to stderr; stdout carries the reports.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "PSRTIME_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> LevelFilter {
        match self {
            Self::Quiet => LevelFilter::WARN,
            Self::Normal => LevelFilter::INFO,
            Self::Verbose => LevelFilter::DEBUG,
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbosity: Verbosity, no_color: bool) {
    let filter = build_filter(verbosity, std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
    let use_ansi = !no_color && std::io::IsTerminal::is_terminal(&std::io::stderr());

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(verbosity == Verbosity::Verbose);

    // `try_init` so tests and embedders that already set a subscriber keep it.
    let result = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time().compact())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn build_filter(verbosity: Verbosity, project: Option<String>, rust_log: Option<String>) -> EnvFilter {
    for directives in [project, rust_log].into_iter().flatten() {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    EnvFilter::builder()
        .with_default_directive(verbosity.default_level().into())
        .parse_lossy("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_verbosity() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::Quiet.default_level(), LevelFilter::WARN);
    }

    #[test]
    fn env_directives_take_priority() {
        let hint = |f: EnvFilter| f.max_level_hint();
        assert_eq!(
            hint(build_filter(Verbosity::Quiet, Some("debug".into()), Some("error".into()))),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(
            hint(build_filter(Verbosity::Quiet, None, Some("error".into()))),
            Some(LevelFilter::ERROR)
        );
        assert_eq!(hint(build_filter(Verbosity::Verbose, None, None)), Some(LevelFilter::DEBUG));
    }
}
