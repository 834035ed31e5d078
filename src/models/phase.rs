//! Phase model evaluation.
//!
//! The fitters rely on three primitive operations:
//! - rotational phase at an arrival time (for residuals)
//! - instantaneous spin frequency (phase → time conversion)
//! - a design row of phase derivatives w.r.t. the free parameters (for WLS)
//!
//! Arrival times are moved to the pulsar frame by a geometric delay: a Roemer
//! term for a circular 1 AU orbit plus the parallax curvature term. The orbit
//! is the equatorial circle, so `RAJ`/`DECJ` act as orbital longitude and
//! latitude; this keeps derivatives analytic and is exact for self-consistent
//! simulated data.
//!
//! Receiver jumps move a TOA back by its receiver's offset before any of the
//! above is evaluated, see [`PhaseModel::arrival_mjd`].

use std::f64::consts::PI;

use crate::domain::Toa;
use crate::error::{TimingError, TimingResult};
use crate::models::{FitParam, TimingModel};

pub const SECS_PER_DAY: f64 = 86_400.0;
pub const DAYS_PER_YEAR: f64 = 365.25;
/// 1 AU in light-seconds.
pub const AU_LIGHT_SECONDS: f64 = 499.004_783_836;
/// 1 pc in light-seconds.
pub const PC_LIGHT_SECONDS: f64 = 1.029_271_250_9e8;
pub const MAS_TO_RAD: f64 = PI / (180.0 * 3600.0 * 1000.0);
/// MJD at which the orbital longitude is zero.
const ORBIT_ZERO_MJD: f64 = 51_623.5;

/// Amplitude (s) of the parallax term per mas.
const PX_DELAY_PER_MAS: f64 = AU_LIGHT_SECONDS * AU_LIGHT_SECONDS / (2.0 * 1000.0 * PC_LIGHT_SECONDS);

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseModel {
    spin: [f64; 4],
    pepoch: f64,
    posepoch: f64,
    ra: f64,
    dec: f64,
    pmra: f64,
    pmdec: f64,
    px: f64,
    /// Receiver → offset (s).
    jumps: Vec<(String, f64)>,
}

struct Geometry {
    cos_dec: f64,
    sin_dec: f64,
    cos_psi: f64,
    sin_psi: f64,
}

impl PhaseModel {
    pub fn from_model(model: &TimingModel) -> TimingResult<Self> {
        let pepoch = model
            .get("PEPOCH")
            .ok_or_else(|| TimingError::Configuration("timing model has no PEPOCH".to_string()))?;
        let mut phase = Self {
            spin: [0.0; 4],
            pepoch,
            posepoch: model.get("POSEPOCH").unwrap_or(pepoch),
            ra: 0.0,
            dec: 0.0,
            pmra: 0.0,
            pmdec: 0.0,
            px: 0.0,
            jumps: model.jumps().map(|j| (j.receiver.clone(), j.offset)).collect(),
        };
        for param in FitParam::ALL {
            phase.set(param, model.value(param));
        }
        if !(phase.spin[0] > 0.0) {
            return Err(TimingError::Configuration(
                "timing model needs a positive F0".to_string(),
            ));
        }
        Ok(phase)
    }

    pub fn get(&self, param: FitParam) -> f64 {
        match param {
            FitParam::F0 => self.spin[0],
            FitParam::F1 => self.spin[1],
            FitParam::F2 => self.spin[2],
            FitParam::F3 => self.spin[3],
            FitParam::RaJ => self.ra,
            FitParam::DecJ => self.dec,
            FitParam::PmRa => self.pmra,
            FitParam::PmDec => self.pmdec,
            FitParam::Px => self.px,
        }
    }

    pub fn set(&mut self, param: FitParam, value: f64) {
        match param {
            FitParam::F0 => self.spin[0] = value,
            FitParam::F1 => self.spin[1] = value,
            FitParam::F2 => self.spin[2] = value,
            FitParam::F3 => self.spin[3] = value,
            FitParam::RaJ => self.ra = value,
            FitParam::DecJ => self.dec = value,
            FitParam::PmRa => self.pmra = value,
            FitParam::PmDec => self.pmdec = value,
            FitParam::Px => self.px = value,
        }
    }

    /// Arrival time of `toa` (MJD) with its receiver's jump removed.
    pub fn arrival_mjd(&self, toa: &Toa) -> f64 {
        let offset = self
            .jumps
            .iter()
            .find(|(receiver, _)| *receiver == toa.notes.rcvr)
            .map_or(0.0, |(_, offset)| *offset);
        toa.mjd - offset / SECS_PER_DAY
    }

    /// Copy the given parameters into `model`.
    pub fn write_params(&self, model: &mut TimingModel, params: &[FitParam]) {
        for &param in params {
            model.set(param.as_str(), self.get(param));
        }
    }

    fn geometry(&self, mjd: f64) -> Geometry {
        let years = (mjd - self.posepoch) / DAYS_PER_YEAR;
        let ra = self.ra + self.pmra * MAS_TO_RAD * years;
        let dec = self.dec + self.pmdec * MAS_TO_RAD * years;
        let theta = 2.0 * PI * (mjd - ORBIT_ZERO_MJD) / DAYS_PER_YEAR;
        let psi = theta - ra;
        Geometry {
            cos_dec: dec.cos(),
            sin_dec: dec.sin(),
            cos_psi: psi.cos(),
            sin_psi: psi.sin(),
        }
    }

    /// Geometric delay (s) added to the arrival time.
    pub fn delay(&self, mjd: f64) -> f64 {
        let g = self.geometry(mjd);
        let projection = g.cos_dec * g.cos_psi;
        AU_LIGHT_SECONDS * projection - self.px * PX_DELAY_PER_MAS * (1.0 - projection * projection)
    }

    /// Seconds since PEPOCH in the pulsar frame.
    pub fn spin_time(&self, mjd: f64) -> f64 {
        (mjd - self.pepoch) * SECS_PER_DAY + self.delay(mjd)
    }

    pub fn phase(&self, mjd: f64) -> f64 {
        let dt = self.spin_time(mjd);
        // Horner form of Σ F_k dt^(k+1) / (k+1)!
        let [f0, f1, f2, f3] = self.spin;
        dt * (f0 + dt * (f1 / 2.0 + dt * (f2 / 6.0 + dt * f3 / 24.0)))
    }

    pub fn frequency(&self, mjd: f64) -> f64 {
        let dt = self.spin_time(mjd);
        let [f0, f1, f2, f3] = self.spin;
        f0 + dt * (f1 + dt * (f2 / 2.0 + dt * f3 / 6.0))
    }

    /// Fill `out` with ∂phase/∂param for each entry of `params`.
    ///
    /// # Panics
    /// Panics if `out` is shorter than `params`.
    pub fn fill_design_row(&self, mjd: f64, params: &[FitParam], out: &mut [f64]) {
        let dt = self.spin_time(mjd);
        let nu = self.frequency(mjd);
        let g = self.geometry(mjd);
        let years = (mjd - self.posepoch) / DAYS_PER_YEAR;
        let px_amp = self.px * PX_DELAY_PER_MAS;

        // ∂delay/∂α and ∂delay/∂δ
        let d_ra = AU_LIGHT_SECONDS * g.cos_dec * g.sin_psi
            + px_amp * g.cos_dec * g.cos_dec * 2.0 * g.sin_psi * g.cos_psi;
        let d_dec = -AU_LIGHT_SECONDS * g.sin_dec * g.cos_psi
            - px_amp * 2.0 * g.sin_dec * g.cos_dec * g.cos_psi * g.cos_psi;

        for (slot, &param) in out.iter_mut().zip(params) {
            *slot = match param {
                FitParam::F0 => dt,
                FitParam::F1 => dt * dt / 2.0,
                FitParam::F2 => dt * dt * dt / 6.0,
                FitParam::F3 => dt * dt * dt * dt / 24.0,
                FitParam::RaJ => nu * d_ra,
                FitParam::DecJ => nu * d_dec,
                FitParam::PmRa => nu * d_ra * MAS_TO_RAD * years,
                FitParam::PmDec => nu * d_dec * MAS_TO_RAD * years,
                FitParam::Px => {
                    let projection = g.cos_dec * g.cos_psi;
                    -nu * PX_DELAY_PER_MAS * (1.0 - projection * projection)
                }
            };
        }
    }
}

/// Residuals of a model on a TOA set, pulse numbers held fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Time residuals (µs), weighted mean removed.
    pub residuals_us: Vec<f64>,
    pub errors_us: Vec<f64>,
    /// Σ (r/σ)².
    pub chi2: f64,
}

/// Integer pulse numbers nearest to the model phase, after removing the mean
/// fractional offset so a constant half-cycle shift does not split the set.
pub fn assign_pulse_numbers(phase: &PhaseModel, toas: &[Toa]) -> Vec<f64> {
    let phases: Vec<f64> = toas.iter().map(|t| phase.phase(phase.arrival_mjd(t))).collect();
    let (sin_sum, cos_sum) = phases.iter().fold((0.0, 0.0), |(s, c), p| {
        let angle = 2.0 * PI * (p - p.round());
        (s + angle.sin(), c + angle.cos())
    });
    let offset = if sin_sum == 0.0 && cos_sum == 0.0 {
        0.0
    } else {
        sin_sum.atan2(cos_sum) / (2.0 * PI)
    };
    phases.iter().map(|p| (p - offset).round()).collect()
}

/// Phase residuals `phase − N` (cycles), no mean removed.
pub fn phase_offsets(phase: &PhaseModel, toas: &[Toa], pulse_numbers: &[f64]) -> Vec<f64> {
    toas.iter()
        .zip(pulse_numbers)
        .map(|(toa, n)| phase.phase(phase.arrival_mjd(toa)) - n)
        .collect()
}

/// Phase-domain weights `1 / (σ_t ν)²`.
pub fn phase_weights(phase: &PhaseModel, toas: &[Toa]) -> Vec<f64> {
    toas.iter()
        .map(|toa| {
            let sigma_phase = toa.error_us * 1e-6 * phase.frequency(phase.arrival_mjd(toa));
            1.0 / (sigma_phase * sigma_phase)
        })
        .collect()
}

pub fn evaluate(phase: &PhaseModel, toas: &[Toa], pulse_numbers: &[f64]) -> Evaluation {
    let offsets = phase_offsets(phase, toas, pulse_numbers);
    let weights = phase_weights(phase, toas);
    let wsum: f64 = weights.iter().sum();
    let mean = if wsum > 0.0 {
        offsets.iter().zip(&weights).map(|(o, w)| o * w).sum::<f64>() / wsum
    } else {
        0.0
    };

    let mut residuals_us = Vec::with_capacity(toas.len());
    let mut errors_us = Vec::with_capacity(toas.len());
    let mut chi2 = 0.0;
    for (toa, offset) in toas.iter().zip(&offsets) {
        let r_us = (offset - mean) / phase.frequency(phase.arrival_mjd(toa)) * 1e6;
        chi2 += (r_us / toa.error_us).powi(2);
        residuals_us.push(r_us);
        errors_us.push(toa.error_us);
    }
    Evaluation {
        residuals_us,
        errors_us,
        chi2,
    }
}

/// Pre-fit residuals (µs) of `model` on `toas`, in input order.
pub fn prefit_residuals(model: &TimingModel, toas: &[Toa]) -> TimingResult<Vec<f64>> {
    let phase = PhaseModel::from_model(model)?;
    let numbers = assign_pulse_numbers(&phase, toas);
    Ok(evaluate(&phase, toas, &numbers).residuals_us)
}
