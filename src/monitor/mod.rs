//! Post-cycle health checks over the solution history.
//!
//! Checkers form a fixed registry ([`Checker::REGISTRY`]) and run in order.
//! `Basics` always runs first; later checkers see its report.
//! Delivery of alerts is out of scope: results are logged and returned.

use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::{debug, error, warn};

use crate::domain::{FITTING_FAILED, TimingSolution};
use crate::error::TimingResult;
use crate::math::mad_z_score;

/// Solutions needed before the trend checks say anything.
const MIN_HISTORY: usize = 7;
/// Reference window for the χ²_r jump test, excluding the latest solution.
const CHI2R_WINDOW: usize = 7;
/// Consecutive increases of χ²_r that raise a warning.
const RISING_RUN: usize = 5;
/// MAD z-scores for the urgent and warning levels (99.7% and 95%).
const Z_URGENT: f64 = 3.0;
const Z_WARNING: f64 = 1.96;
/// TOA errors below this fraction of a turn are never flagged.
const ERROR_PHASE_GATE: f64 = 0.01;
/// Residuals below this fraction of a turn may be timing noise.
const RESIDUAL_PHASE_GATE: f64 = 0.015;
/// Consecutive failed fits that make the fitting check urgent.
const FAILED_RUN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    Ok,
    Warning,
    Urgent,
}

impl CheckLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckLevel::Ok => "ok",
            CheckLevel::Warning => "warning",
            CheckLevel::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    /// Which check produced this (`chi2r`, `residual`, ...).
    pub check: &'static str,
    /// Stable outcome id, e.g. `chi2r_sudden_increase`.
    pub id: &'static str,
    pub level: CheckLevel,
    pub message: String,
}

impl CheckResult {
    fn new(check: &'static str, id: &'static str, level: CheckLevel, message: impl Into<String>) -> Self {
        Self {
            check,
            id,
            level,
            message: message.into(),
        }
    }

    fn ok(check: &'static str, id: &'static str, message: &str) -> Self {
        Self::new(check, id, CheckLevel::Ok, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub checker: &'static str,
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub fn worst(&self) -> CheckLevel {
        self.results.iter().map(|r| r.level).max().unwrap_or(CheckLevel::Ok)
    }

    pub fn result(&self, check: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.check == check)
    }
}

pub struct CheckContext<'a> {
    /// Oldest first.
    pub solutions: &'a [TimingSolution],
    /// Report of the `Basics` checker, once it has run.
    pub basics: Option<&'a CheckReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checker {
    Basics,
    Glitch,
}

impl Checker {
    pub const REGISTRY: [Checker; 2] = [Checker::Basics, Checker::Glitch];

    pub fn name(self) -> &'static str {
        match self {
            Checker::Basics => "basics",
            Checker::Glitch => "glitch",
        }
    }

    pub fn check(self, ctx: &CheckContext<'_>) -> TimingResult<CheckReport> {
        let results = match self {
            Checker::Basics => vec![
                check_chi2r(ctx.solutions),
                check_residual(ctx.solutions),
                check_fitting(ctx.solutions),
            ],
            Checker::Glitch => vec![check_glitch(ctx.basics)],
        };
        Ok(CheckReport {
            checker: self.name(),
            results,
        })
    }
}

/// Run every registered checker. A checker that errors is logged and skipped.
pub fn run_checks(solutions: &[TimingSolution]) -> Vec<CheckReport> {
    let mut reports: Vec<CheckReport> = Vec::with_capacity(Checker::REGISTRY.len());
    for checker in Checker::REGISTRY {
        debug!(checker = checker.name(), "running checker");
        let ctx = CheckContext {
            solutions,
            basics: reports.iter().find(|r| r.checker == Checker::Basics.name()),
        };
        match checker.check(&ctx) {
            Ok(report) => reports.push(report),
            Err(e) => error!(checker = checker.name(), error = %e, "checker failed"),
        }
    }
    for result in reports.iter().flat_map(|r| &r.results) {
        if result.level > CheckLevel::Ok {
            warn!(
                check = result.check,
                id = result.id,
                level = result.level.as_str(),
                "{}",
                result.message
            );
        }
    }
    reports
}

fn check_chi2r(solutions: &[TimingSolution]) -> CheckResult {
    const CHECK: &str = "chi2r";
    let chi2rs: Vec<f64> = solutions.iter().filter_map(|s| s.chi2_reduced).collect();
    if chi2rs.len() < CHI2R_WINDOW + 1 {
        return CheckResult::ok(CHECK, "too_few_solutions", "need at least 8 fitted solutions for a chi2r trend");
    }

    let tail = &chi2rs[chi2rs.len() - (RISING_RUN + 1)..];
    if tail.windows(2).all(|w| w[1] > w[0]) {
        return CheckResult::new(
            CHECK,
            "chi2r_keeps_increasing",
            CheckLevel::Warning,
            format!("chi2r rose {RISING_RUN} times in a row"),
        );
    }

    let (last, before) = (chi2rs[chi2rs.len() - 1], &chi2rs[..chi2rs.len() - 1]);
    let window = &before[before.len() - CHI2R_WINDOW..];
    let mean = window.mean();
    let std = window.population_std_dev();
    if last > mean + 7.0 * std {
        CheckResult::new(
            CHECK,
            "chi2r_very_sudden_increase",
            CheckLevel::Urgent,
            format!("last chi2r {last:.3} > mean {mean:.3} + 7 std ({:.3}) of the previous 7", 7.0 * std),
        )
    } else if last > mean + 3.0 * std {
        CheckResult::new(
            CHECK,
            "chi2r_sudden_increase",
            CheckLevel::Warning,
            format!("last chi2r {last:.3} > mean {mean:.3} + 3 std ({:.3}) of the previous 7", 3.0 * std),
        )
    } else {
        CheckResult::ok(CHECK, "chi2r_ok", "chi2r is normal")
    }
}

fn check_residual(solutions: &[TimingSolution]) -> CheckResult {
    const CHECK: &str = "residual";
    if solutions.len() < MIN_HISTORY {
        return CheckResult::ok(CHECK, "too_few_solutions", "need at least 7 solutions for a residual check");
    }
    let Some(latest) = solutions.last() else {
        return CheckResult::ok(CHECK, "too_few_solutions", "no solutions");
    };
    let (val, err) = (&latest.residuals.val, &latest.residuals.err);
    let (Some(&last_val), Some(&last_err), Some(f0)) =
        (val.last(), err.last(), latest.fitted_params.get("F0").copied())
    else {
        return CheckResult::ok(CHECK, "no_residuals", "latest solution has no residuals");
    };

    let err_phase = last_err * 1e-6 * f0;
    if err_phase > ERROR_PHASE_GATE {
        let z = mad_z_score(err, last_err);
        if z > Z_URGENT {
            return CheckResult::new(
                CHECK,
                "toa_error_very_sudden_increase",
                CheckLevel::Urgent,
                format!("latest TOA error is a 3-sigma outlier ({err_phase:.3} in phase)"),
            );
        }
        if z > Z_WARNING {
            return CheckResult::new(
                CHECK,
                "toa_error_sudden_increase",
                CheckLevel::Warning,
                format!("latest TOA error is a 2-sigma outlier ({err_phase:.3} in phase)"),
            );
        }
    }

    let val_phase = last_val * 1e-6 * f0;
    if val_phase.abs() > RESIDUAL_PHASE_GATE {
        let z = mad_z_score(val, last_val);
        if z > Z_URGENT {
            return CheckResult::new(
                CHECK,
                "residual_very_sudden_increase",
                CheckLevel::Urgent,
                format!("latest residual is a 3-sigma outlier ({val_phase:.3} in phase)"),
            );
        }
        if z > Z_WARNING {
            return CheckResult::new(
                CHECK,
                "residual_sudden_increase",
                CheckLevel::Warning,
                format!("latest residual is a 2-sigma outlier ({val_phase:.3} in phase)"),
            );
        }
    }
    CheckResult::ok(CHECK, "residual_ok", "residuals are normal")
}

fn check_fitting(solutions: &[TimingSolution]) -> CheckResult {
    const CHECK: &str = "fitting";
    let failed_run = solutions.iter().rev().take_while(|s| s.fit_failed()).count();
    if failed_run >= FAILED_RUN {
        CheckResult::new(
            CHECK,
            "fitting_failed",
            CheckLevel::Urgent,
            format!("the last {failed_run} fits failed"),
        )
    } else if failed_run > 0 {
        CheckResult::new(
            CHECK,
            "fitting_failed_once",
            CheckLevel::Warning,
            format!("latest solution is marked {FITTING_FAILED}"),
        )
    } else {
        CheckResult::ok(CHECK, "fitting_ok", "fitting status is normal")
    }
}

/// A residual jump that survives the noise gate looks like a glitch.
fn check_glitch(basics: Option<&CheckReport>) -> CheckResult {
    const CHECK: &str = "glitch";
    let jumped = basics
        .and_then(|b| b.result("residual"))
        .is_some_and(|r| matches!(r.id, "residual_sudden_increase" | "residual_very_sudden_increase"));
    if jumped {
        CheckResult::new(
            CHECK,
            "glitch_candidate",
            CheckLevel::Urgent,
            "glitch-like residual jump in the latest solution",
        )
    } else {
        CheckResult::ok(CHECK, "no_glitch", "no glitch detected")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Residuals, SolutionNotes};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn solution(i: usize, chi2r: Option<f64>, residuals: Residuals) -> TimingSolution {
        TimingSolution {
            timestamp: Utc::now() + Duration::seconds(i as i64),
            content_ids: vec![format!("obs_{i}")],
            obs_mjds: vec![59000.0 + i as f64],
            unfrozen_params: vec!["F0".into()],
            residuals,
            chi2: chi2r,
            chi2_reduced: chi2r,
            fitted_params: BTreeMap::from([("F0".to_string(), 2.0)]),
            notes: SolutionNotes::default(),
        }
    }

    fn quiet_residuals() -> Residuals {
        Residuals {
            val: vec![100.0, -120.0, 80.0, -90.0, 110.0, -100.0, 95.0, -105.0],
            err: vec![1000.0; 8],
        }
    }

    fn history(chi2rs: &[f64]) -> Vec<TimingSolution> {
        chi2rs
            .iter()
            .enumerate()
            .map(|(i, &c)| solution(i, Some(c), quiet_residuals()))
            .collect()
    }

    #[test]
    fn short_history_is_ok() {
        let reports = run_checks(&history(&[1.0, 1.1, 0.9]));
        assert_eq!(reports[0].checker, "basics");
        assert_eq!(reports[0].result("chi2r").unwrap().id, "too_few_solutions");
        assert!(reports.iter().all(|r| r.worst() == CheckLevel::Ok));
    }

    #[test]
    fn steady_rise_is_a_warning() {
        let result = check_chi2r(&history(&[1.0, 1.0, 1.0, 1.01, 1.02, 1.03, 1.04, 1.05]));
        assert_eq!(result.id, "chi2r_keeps_increasing");
        assert_eq!(result.level, CheckLevel::Warning);
    }

    #[test]
    fn sudden_jump_is_urgent() {
        let result = check_chi2r(&history(&[1.0, 1.1, 0.9, 1.0, 1.1, 0.9, 1.0, 1.1, 0.9, 1.0, 1.05, 0.95, 40.0]));
        assert_eq!(result.id, "chi2r_very_sudden_increase");
        assert_eq!(result.level, CheckLevel::Urgent);
    }

    #[test]
    fn residual_jump_triggers_glitch_checker() {
        let mut solutions = history(&[1.0; 7]);
        // 20 ms at F0 = 2 Hz is 0.04 turns, past the noise gate.
        solutions[6].residuals.val.push(20_000.0);
        solutions[6].residuals.err.push(1000.0);
        let reports = run_checks(&solutions);
        assert_eq!(reports[0].result("residual").unwrap().level, CheckLevel::Urgent);
        assert_eq!(reports[1].checker, "glitch");
        assert_eq!(reports[1].results[0].id, "glitch_candidate");
    }

    #[test]
    fn consecutive_failures_escalate() {
        let mut solutions = history(&[1.0; 4]);
        for s in solutions.iter_mut().skip(1) {
            s.notes.remark.push(FITTING_FAILED.to_string());
        }
        assert_eq!(check_fitting(&solutions).level, CheckLevel::Urgent);
        assert_eq!(check_fitting(&solutions[..2]).level, CheckLevel::Warning);
        assert_eq!(check_fitting(&solutions[..1]).level, CheckLevel::Ok);
    }
}
