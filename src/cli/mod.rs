//! Command-line parsing for `psrtime`.
//!
//! Parsing and dispatch stay separate from the timing code: this module only
//! declares arguments, `app` acts on them.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "psrtime", version, about = "Incremental pulsar timing-fit engine")]
pub struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable ANSI colours in log output.
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the next batch of observations, if there is one.
    Advance(PulsarArgs),
    /// Keep fitting batches until no new data is left.
    Run(PulsarArgs),
    /// Run the health checkers over the stored solutions.
    Check(PulsarArgs),
    /// Print the latest solution, or the whole history.
    Show(ShowArgs),
    /// Write a synthetic pulsar directory for trying the pipeline out.
    Simulate(SimulateArgs),
}

/// Where one pulsar's files live.
#[derive(Debug, Args, Clone)]
pub struct PulsarArgs {
    /// Pulsar working directory (model file, backups, store).
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Observation manifest [default: <DIR>/manifest.json].
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// JSON configuration [default: <DIR>/config.json].
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TOA/solution store [default: <DIR>/psrtime_store.json].
    #[arg(long)]
    pub store: Option<PathBuf>,
}

impl PulsarArgs {
    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.manifest, "manifest.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.resolve(&self.config, "config.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.store, "psrtime_store.json")
    }

    fn resolve(&self, explicit: &Option<PathBuf>, default_name: &str) -> PathBuf {
        explicit.clone().unwrap_or_else(|| self.dir.join(default_name))
    }
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    #[command(flatten)]
    pub pulsar: PulsarArgs,

    /// One line per stored solution instead of the latest in full.
    #[arg(long)]
    pub history: bool,

    /// Emit JSON.
    #[arg(long)]
    pub json: bool,

    /// Dump every stored TOA as a tim file instead.
    #[arg(long, conflicts_with_all = ["history", "json"])]
    pub tim: bool,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Output directory (created if needed).
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Number of observations.
    #[arg(short = 'n', long, default_value_t = 40)]
    pub n_obs: usize,

    /// MJD of the first observation.
    #[arg(long, default_value_t = 60000.0)]
    pub start_mjd: f64,

    /// Days between observations.
    #[arg(long, default_value_t = 1.0)]
    pub cadence: f64,

    /// Spin frequency of the simulated pulsar (Hz).
    #[arg(long, default_value_t = 1.7)]
    pub f0: f64,

    /// TOA uncertainty (µs).
    #[arg(long, default_value_t = 300.0)]
    pub error_us: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl SimulateArgs {
    pub fn mjds(&self) -> Vec<f64> {
        (0..self.n_obs)
            .map(|i| self.start_mjd + self.cadence * i as f64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_inside_dir() {
        let cli = Cli::parse_from(["psrtime", "advance", "--dir", "/data/J0000"]);
        let Command::Advance(args) = cli.command else {
            panic!("expected advance");
        };
        assert_eq!(args.manifest_path(), PathBuf::from("/data/J0000/manifest.json"));
        assert_eq!(args.config_path(), PathBuf::from("/data/J0000/config.json"));
        assert_eq!(args.store_path(), PathBuf::from("/data/J0000/psrtime_store.json"));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["psrtime", "run", "-v", "--no-color", "--config", "c.json"]);
        assert!(cli.verbose);
        assert!(cli.no_color);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config_path(), PathBuf::from("c.json"));
    }

    #[test]
    fn tim_dump_excludes_json() {
        assert!(Cli::try_parse_from(["psrtime", "show", "--tim", "--json"]).is_err());
        let cli = Cli::parse_from(["psrtime", "show", "--tim"]);
        let Command::Show(args) = cli.command else {
            panic!("expected show");
        };
        assert!(args.tim);
    }

    #[test]
    fn simulate_mjds_follow_cadence() {
        let cli = Cli::parse_from(["psrtime", "simulate", "-d", "out", "-n", "3", "--start-mjd", "59000", "--cadence", "2"]);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.mjds(), vec![59000.0, 59002.0, 59004.0]);
    }
}
