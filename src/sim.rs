//! Synthetic TOA generation.
//!
//! Each requested observation epoch is moved to the nearest following integer
//! pulse phase of a reference model (Newton steps on `φ(t) = N`), then white
//! Gaussian noise of the quoted uncertainty is added. Output is fully
//! determined by the seed.

use std::path::Path;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{Observation, Toa, ToaNotes};
use crate::error::{TimingError, TimingResult};
use crate::io::manifest::write_manifest;
use crate::io::tim::format_tim_line;
use crate::io::write_atomic;
use crate::models::{PhaseModel, TimingModel, phase::SECS_PER_DAY};

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Quoted (and injected) TOA uncertainty (µs).
    pub error_us: f64,
    pub seed: u64,
    pub frequency_mhz: f64,
    pub telescope: String,
}

impl SimOptions {
    pub fn new(error_us: f64, seed: u64) -> Self {
        Self {
            error_us,
            seed,
            frequency_mhz: 600.0,
            telescope: "chime".to_string(),
        }
    }
}

fn validate(opts: &SimOptions) -> TimingResult<()> {
    if !(opts.error_us.is_finite() && opts.error_us > 0.0) {
        return Err(TimingError::Configuration(format!(
            "simulated TOA error must be positive, got {}",
            opts.error_us
        )));
    }
    Ok(())
}

/// Arrival time (MJD) of the first pulse at or after `mjd`.
fn next_pulse(phase: &PhaseModel, mjd: f64) -> f64 {
    let target = phase.phase(mjd).ceil();
    let mut t = mjd;
    for _ in 0..5 {
        t -= (phase.phase(t) - target) / phase.frequency(t) / SECS_PER_DAY;
    }
    t
}

/// One TOA per epoch in `mjds`, in input order.
pub fn simulate_toas(model: &TimingModel, mjds: &[f64], opts: &SimOptions) -> TimingResult<Vec<Toa>> {
    validate(opts)?;
    let phase = PhaseModel::from_model(model)?;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let normal = Normal::new(0.0, opts.error_us * 1e-6)
        .map_err(|e| TimingError::Configuration(format!("noise distribution error: {e}")))?;

    Ok(mjds
        .iter()
        .enumerate()
        .map(|(i, &mjd)| {
            let noise_s: f64 = normal.sample(&mut rng);
            let arrival = next_pulse(&phase, mjd) + noise_s / SECS_PER_DAY;
            let content_id = format!("sim_{i:05}_{mjd:.5}");
            let raw_line = format_tim_line(&content_id, opts.frequency_mhz, arrival, opts.error_us, &opts.telescope);
            Toa {
                content_id,
                frequency: opts.frequency_mhz,
                mjd: arrival,
                error_us: opts.error_us,
                telescope: opts.telescope.clone(),
                raw_line,
                notes: ToaNotes {
                    label: "sim".to_string(),
                    rcvr: opts.telescope.clone(),
                },
            }
        })
        .collect())
}

/// Write a self-contained demo data set into `dir`:
/// `pulsar.par` (a perturbed starting model), one `.tim` sidecar per
/// observation and `manifest.json`.
pub fn write_demo_dataset(
    dir: &Path,
    truth: &TimingModel,
    start: &TimingModel,
    mjds: &[f64],
    opts: &SimOptions,
) -> TimingResult<Vec<Observation>> {
    std::fs::create_dir_all(dir.join("obs")).map_err(|e| TimingError::io(dir, e))?;
    let toas = simulate_toas(truth, mjds, opts)?;

    let mut observations = Vec::with_capacity(toas.len());
    for (toa, &mjd) in toas.iter().zip(mjds) {
        let archive = dir.join("obs").join(format!("{}.ar", toa.content_id));
        let sidecar = archive.with_extension("ar.tim");
        let observation = Observation::new(mjd, &archive, "sim", opts.telescope.clone());
        // The sidecar carries the archive's own id in its first column.
        let line = format_tim_line(
            &observation.content_id,
            toa.frequency,
            toa.mjd,
            toa.error_us,
            &toa.telescope,
        );
        write_atomic(&sidecar, format!("FORMAT 1\n{line}\n").as_bytes())?;
        observations.push(observation);
    }

    write_atomic(&dir.join("pulsar.par"), start.to_text().as_bytes())?;
    write_manifest(&dir.join("manifest.json"), &observations)?;
    Ok(observations)
}

/// A slowly spinning-down truth model and a starting model that is slightly
/// off in F0 and position, as used by `psrtime simulate`.
pub fn demo_models(f0: f64, epoch_mjd: f64) -> TimingResult<(TimingModel, TimingModel)> {
    let truth = TimingModel::parse(&format!(
        "PSRJ J0000+0000\nF0 {f0:.15} 1\nF1 {f1:.6e}\nPEPOCH {epoch_mjd}\nPOSEPOCH {epoch_mjd}\nRAJ 1.2\nDECJ 0.4\n",
        f1 = -1e-15 * f0,
    ))?;
    truth.validate()?;
    let mut start = truth.clone();
    start.set("F0", f0 * (1.0 + 1e-10));
    start.set("F1", 0.0);
    start.set("RAJ", 1.2 + 1e-4);
    start.set("DECJ", 0.4 - 1e-4);
    Ok((truth, start))
}
