//! Formatted terminal output.
//!
//! Formatting lives here so the engine and fitters stay free of presentation
//! code, and output changes stay in one file.

use crate::domain::{CycleStatus, TimingSolution};
use crate::engine::CycleReport;
use crate::monitor::{CheckLevel, CheckReport};
use crate::report::{rank_residuals, weighted_rms};

/// One line per cycle, as printed by `advance` and `run`.
pub fn format_cycle(report: &CycleReport) -> String {
    match (&report.status, &report.solution, &report.message) {
        (CycleStatus::Success, Some(solution), _) => format!(
            "{}: {} obs up to MJD {:.3}, chi2r={}, free=[{}]{}",
            report.status.as_str(),
            solution.obs_mjds.len(),
            solution.last_mjd().unwrap_or(f64::NAN),
            fmt_opt(solution.chi2_reduced),
            solution.unfrozen_params.join(","),
            fmt_remarks(solution),
        ),
        (_, _, Some(message)) => format!("{}: {message}", report.status.as_str()),
        _ => report.status.as_str().to_string(),
    }
}

/// Detailed view of one solution.
pub fn format_solution(solution: &TimingSolution) -> String {
    let mut out = String::new();

    out.push_str("=== psrtime - timing solution ===\n");
    out.push_str(&format!("Timestamp: {}\n", solution.timestamp.to_rfc3339()));
    out.push_str(&format!(
        "Observations: n={} | MJD=[{:.3}, {:.3}]\n",
        solution.obs_mjds.len(),
        solution.obs_mjds.first().copied().unwrap_or(f64::NAN),
        solution.last_mjd().unwrap_or(f64::NAN),
    ));
    out.push_str(&format!(
        "Fit: chi2={} chi2r={} wrms={:.3}us{}\n",
        fmt_opt(solution.chi2),
        fmt_opt(solution.chi2_reduced),
        weighted_rms(&solution.residuals.val, &solution.residuals.err),
        fmt_remarks(solution),
    ));
    if !solution.notes.admitted.is_empty() {
        out.push_str(&format!(
            "Admitted: [{}] p={}\n",
            solution.notes.admitted.join(","),
            fmt_opt(solution.notes.admission_p_value)
        ));
    }

    out.push_str("\nParameters:\n");
    for (name, value) in &solution.fitted_params {
        let free = if solution.unfrozen_params.contains(name) { "*" } else { " " };
        out.push_str(&format!("{free} {name:<10} {value:.15e}\n"));
    }

    if !solution.notes.bad_toas.is_empty() {
        out.push_str("\nRejected TOAs:\n");
        out.push_str(&header(&["id", "mjd", "stage", "resid_us", "err_us"]));
        for bad in &solution.notes.bad_toas {
            out.push_str(
                format!(
                    "{:<28} {:>12.5} {:>10} {:>12.2} {:>12.2}",
                    truncate(&bad.content_id, 28),
                    bad.mjd,
                    bad.stage.as_str(),
                    bad.residual_us,
                    bad.error_us
                )
                .trim_end(),
            );
            out.push('\n');
        }
    }

    let worst = rank_residuals(solution, 5);
    if !worst.is_empty() {
        out.push_str("\nLargest residuals:\n");
        for r in worst {
            out.push_str(&format!(
                "  MJD {:.5}  {:>10.2}us ± {:>8.2}us  ({:.1} sigma)\n",
                r.mjd, r.residual_us, r.error_us, r.significance
            ));
        }
    }
    out
}

/// One row per stored solution, oldest first.
pub fn format_history(solutions: &[TimingSolution]) -> String {
    let mut out = String::new();
    out.push_str(&header(&["#", "timestamp", "n_obs", "last_mjd", "chi2r", "free"]));
    for (i, s) in solutions.iter().enumerate() {
        out.push_str(
            format!(
                "{:<28} {:>12} {:>10} {:>12.3} {:>12} {}{}",
                i,
                s.timestamp.format("%Y-%m-%d %H:%M:%S"),
                s.obs_mjds.len(),
                s.last_mjd().unwrap_or(f64::NAN),
                fmt_opt(s.chi2_reduced),
                s.unfrozen_params.join(","),
                fmt_remarks(s),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

pub fn format_checks(reports: &[CheckReport]) -> String {
    let mut out = String::new();
    for report in reports {
        out.push_str(&format!("[{}]\n", report.checker));
        for r in &report.results {
            let marker = match r.level {
                CheckLevel::Ok => " ",
                CheckLevel::Warning => "!",
                CheckLevel::Urgent => "!!",
            };
            out.push_str(&format!("{marker:<2} {:<10} {:<32} {}\n", r.check, r.id, r.message));
        }
    }
    out
}

fn header(columns: &[&str]) -> String {
    let mut names = format!("{:<28}", columns[0]);
    let mut rule = format!("{:-<28}", "");
    for c in &columns[1..] {
        names.push_str(&format!(" {c:>12}"));
        rule.push_str(&format!(" {:-<12}", ""));
    }
    format!("{}\n{}\n", names.trim_end(), rule.trim_end())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |x| format!("{x:.3}"))
}

fn fmt_remarks(solution: &TimingSolution) -> String {
    if solution.notes.remark.is_empty() {
        String::new()
    } else {
        format!(" [{}]", solution.notes.remark.join(","))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CycleState, FITTING_FAILED, Residuals, SolutionNotes};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn solution() -> TimingSolution {
        TimingSolution {
            timestamp: Utc::now(),
            content_ids: vec!["a".into(), "b".into()],
            obs_mjds: vec![59000.0, 59001.0],
            unfrozen_params: vec!["F0".into()],
            residuals: Residuals::default(),
            chi2: None,
            chi2_reduced: None,
            fitted_params: BTreeMap::from([("F0".to_string(), 1.5), ("F1".to_string(), 0.0)]),
            notes: SolutionNotes {
                remark: vec![FITTING_FAILED.to_string()],
                ..SolutionNotes::default()
            },
        }
    }

    #[test]
    fn cycle_line_mentions_remarks() {
        let report = CycleReport {
            status: CycleStatus::Success,
            state: CycleState::Committed,
            solution: Some(solution()),
            message: None,
        };
        let line = format_cycle(&report);
        assert!(line.starts_with("success: 2 obs"));
        assert!(line.contains("chi2r=-"));
        assert!(line.ends_with("[FITTING_FAILED]"));
    }

    #[test]
    fn solution_view_marks_free_parameters() {
        let text = format_solution(&solution());
        assert!(text.lines().any(|l| l.starts_with("* F0")));
        assert!(text.lines().any(|l| l.starts_with("  F1")));
        assert!(!text.contains("Rejected TOAs"));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 4), "abc.");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
