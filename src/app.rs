//! Top-level application orchestration.
//!
//! `src/main.rs` only maps the result of [`run`] to an exit code; this module
//! parses arguments, sets up logging, wires the engine to files on disk and
//! prints reports.

use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Command, PulsarArgs, ShowArgs, SimulateArgs};
use crate::config::TimingConfig;
use crate::domain::{CycleStatus, Observation};
use crate::engine::TimingEngine;
use crate::error::{AppError, TimingError};
use crate::fit::{FitOptions, McmcOptions, PhaseFitter};
use crate::io::tim::render_tim;
use crate::io::{FileStore, ModelFile, TimFilePreprocessor, TimingStore, read_manifest};
use crate::logging::{self, Verbosity};
use crate::monitor::{CheckLevel, run_checks};
use crate::report::{format_checks, format_cycle, format_history, format_solution};
use crate::sim::{SimOptions, demo_models, write_demo_dataset};

type FileEngine = TimingEngine<FileStore, TimFilePreprocessor, PhaseFitter>;

/// Entry point for the `psrtime` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet), cli.no_color);

    match cli.command {
        Command::Advance(args) => handle_advance(&args, false),
        Command::Run(args) => handle_advance(&args, true),
        Command::Check(args) => handle_check(&args),
        Command::Show(args) => handle_show(&args),
        Command::Simulate(args) => handle_simulate(&args),
    }
}

fn open_engine(args: &PulsarArgs) -> Result<(FileEngine, Vec<Observation>), AppError> {
    let config = TimingConfig::load(&args.config_path())?;
    let observations = read_manifest(&args.manifest_path())?;
    let store = FileStore::open(args.store_path())?;
    let fitter = PhaseFitter::new(FitOptions {
        mcmc: McmcOptions {
            seed: config.settings.mcmc_seed,
            ..McmcOptions::default()
        },
        ..FitOptions::default()
    });
    let engine = TimingEngine::new(config, store, TimFilePreprocessor, fitter, ModelFile::in_dir(&args.dir))?;
    Ok((engine, observations))
}

fn handle_advance(args: &PulsarArgs, until_done: bool) -> Result<(), AppError> {
    let (mut engine, observations) = open_engine(args)?;
    info!(
        dir = %args.dir.display(),
        observations = observations.len(),
        pending = engine.pending(&observations).len(),
        tag = %engine.config().metadata.tag,
        "starting"
    );

    let reports = if until_done {
        engine.run(&observations)?
    } else {
        vec![engine.try_advance(&observations)?]
    };
    for report in &reports {
        println!("{}", format_cycle(report));
    }

    if reports.iter().any(|r| r.status == CycleStatus::Success) {
        // Logged by the checkers; the exit code stays 0.
        run_checks(engine.store().all_solutions());
    }
    Ok(())
}

fn handle_check(args: &PulsarArgs) -> Result<(), AppError> {
    let store = FileStore::open(args.store_path())?;
    let reports = run_checks(store.all_solutions());
    print!("{}", format_checks(&reports));
    let worst = reports.iter().map(|r| r.worst()).max().unwrap_or(CheckLevel::Ok);
    info!(worst = worst.as_str(), "checks finished");
    Ok(())
}

fn handle_show(args: &ShowArgs) -> Result<(), AppError> {
    let store = FileStore::open(args.pulsar.store_path())?;
    if args.tim {
        print!("{}", render_tim(store.toas()));
        return Ok(());
    }

    let solutions = store.all_solutions();
    if args.history {
        if args.json {
            println!("{}", to_json(&solutions)?);
        } else {
            print!("{}", format_history(solutions));
        }
        return Ok(());
    }

    let latest = store
        .last_solution()
        .ok_or_else(|| AppError::new(1, format!("no solutions stored in '{}'", store.path().display())))?;
    if args.json {
        println!("{}", to_json(latest)?);
    } else {
        print!("{}", format_solution(latest));
    }
    Ok(())
}

fn handle_simulate(args: &SimulateArgs) -> Result<(), AppError> {
    let (truth, start) = demo_models(args.f0, args.start_mjd)?;
    let observations = write_demo_dataset(
        &args.dir,
        &truth,
        &start,
        &args.mjds(),
        &SimOptions::new(args.error_us, args.seed),
    )?;

    let config_path = args.dir.join("config.json");
    let config = TimingConfig::default().to_value()?;
    let text = serde_json::to_string_pretty(&config).map_err(|e| TimingError::json(&config_path, e))?;
    crate::io::write_atomic(&config_path, text.as_bytes())?;

    println!(
        "wrote {} observations, pulsar.par, manifest.json and config.json to {}",
        observations.len(),
        args.dir.display()
    );
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, AppError> {
    serde_json::to_string_pretty(value).map_err(|e| AppError::new(4, format!("failed to encode JSON: {e}")))
}
