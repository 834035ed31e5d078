//! End-to-end cycles against files in a temporary pulsar directory.

use std::path::Path;

use psrtime::config::TimingConfig;
use psrtime::domain::{CycleStatus, FilterStage, Observation};
use psrtime::engine::TimingEngine;
use psrtime::error::TimingError;
use psrtime::fit::PhaseFitter;
use psrtime::io::tim::format_tim_line;
use psrtime::io::{FileStore, ModelFile, TimFilePreprocessor, TimingStore};
use psrtime::models::TimingModel;
use psrtime::sim::{SimOptions, write_demo_dataset};

type Engine = TimingEngine<FileStore, TimFilePreprocessor, PhaseFitter>;

fn truth() -> TimingModel {
    TimingModel::parse("PSRJ J0534+2200\nF0 1.9 1\nPEPOCH 59000\nPOSEPOCH 59000\nRAJ 1.46\nDECJ 0.38\n")
        .unwrap()
}

fn dataset(dir: &Path, mjds: &[f64]) -> Vec<Observation> {
    let mut start = truth();
    start.set("F0", 1.9 + 3e-9);
    write_demo_dataset(dir, &truth(), &start, mjds, &SimOptions::new(250.0, 17)).unwrap()
}

fn open(dir: &Path, config: TimingConfig) -> Result<Engine, TimingError> {
    TimingEngine::new(
        config,
        FileStore::open(dir.join("store.json"))?,
        TimFilePreprocessor,
        PhaseFitter::default(),
        ModelFile::in_dir(dir),
    )
}

fn daily(first: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| first + i as f64).collect()
}

#[test]
fn first_cycle_takes_the_two_earliest() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &[59000.0, 59001.0, 59002.0]);
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();

    let report = engine.advance(&observations);
    assert_eq!(report.status, CycleStatus::Success);
    let solution = report.solution.unwrap();
    assert_eq!(solution.obs_mjds, vec![59000.0, 59001.0]);
    assert_eq!(solution.unfrozen_params, vec!["F0".to_string()]);
    assert!(solution.chi2.is_some());
}

#[test]
fn new_observation_extends_the_batch_then_no_new_data() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &daily(59000.0, 12));
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();

    // Everything up to MJD 59010.
    let reports = engine.run(&observations[..11]).unwrap();
    assert_eq!(reports.last().unwrap().status, CycleStatus::NoNewData);
    assert_eq!(engine.store().last_solution().unwrap().last_mjd(), Some(59010.0));

    // MJD 59011 arrives.
    let report = engine.advance(&observations);
    let solution = report.solution.unwrap();
    assert_eq!(solution.obs_mjds.len(), 12);
    assert_eq!(solution.last_mjd(), Some(59011.0));
    assert_eq!(engine.advance(&observations).status, CycleStatus::NoNewData);
}

#[test]
fn solutions_only_grow() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &daily(59000.0, 15));
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();
    engine.run(&observations).unwrap();

    let solutions = engine.store().all_solutions();
    assert_eq!(solutions.len(), 14);
    for pair in solutions.windows(2) {
        assert!(pair[1].timestamp > pair[0].timestamp);
        assert!(pair[1].last_mjd() >= pair[0].last_mjd());
        assert!(pair[0].content_ids.iter().all(|id| pair[1].content_ids.contains(id)));
    }
    let backups = engine.model_file().backups().unwrap();
    assert_eq!(backups.len(), solutions.len());
}

#[test]
fn no_op_cycles_leave_files_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &daily(59000.0, 4));
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();
    engine.run(&observations).unwrap();

    let store_before = std::fs::read(dir.path().join("store.json")).unwrap();
    let model_before = std::fs::read(dir.path().join("pulsar.par")).unwrap();
    for _ in 0..2 {
        assert_eq!(engine.advance(&observations).status, CycleStatus::NoNewData);
    }
    assert_eq!(std::fs::read(dir.path().join("store.json")).unwrap(), store_before);
    assert_eq!(std::fs::read(dir.path().join("pulsar.par")).unwrap(), model_before);

    // Same after a restart from disk.
    let mut reopened = open(dir.path(), TimingConfig::default()).unwrap();
    assert_eq!(reopened.advance(&observations).status, CycleStatus::NoNewData);
    assert_eq!(std::fs::read(dir.path().join("store.json")).unwrap(), store_before);
}

#[test]
fn changed_config_is_refused_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &daily(59000.0, 3));
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();
    engine.advance(&observations);

    let mut changed = TimingConfig::default();
    changed.settings.fit_every_n_days = 7.0;
    let err = open(dir.path(), changed).err().unwrap();
    assert!(matches!(err, TimingError::Configuration(_)));
}

#[test]
fn gap_among_newest_blocks_parameter_admission() {
    let dir = tempfile::tempdir().unwrap();
    let mut mjds = daily(59000.0, 10);
    mjds.push(59049.0);
    let observations = dataset(dir.path(), &mjds);
    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();
    engine.run(&observations[..10]).unwrap();

    // Span 49 d unlocks RAJ/DECJ, but the newest TOAs sit across a 40 d gap.
    let solution = engine.advance(&observations).solution.unwrap();
    assert_eq!(solution.last_mjd(), Some(59049.0));
    assert!(solution.notes.admitted.is_empty());
    assert_eq!(solution.unfrozen_params, vec!["F0".to_string()]);
}

#[test]
fn outlier_toa_is_recorded_as_bad() {
    let dir = tempfile::tempdir().unwrap();
    let observations = dataset(dir.path(), &daily(59000.0, 12));

    // Delay observation 4 by 30 ms.
    let sidecar = TimFilePreprocessor::sidecar(&observations[4]);
    let text = std::fs::read_to_string(&sidecar).unwrap();
    let line = text.lines().find(|l| !l.starts_with("FORMAT")).unwrap();
    let f: Vec<&str> = line.split_whitespace().collect();
    let mjd: f64 = f[2].parse::<f64>().unwrap() + 0.030 / 86_400.0;
    let shifted = format_tim_line(f[0], f[1].parse().unwrap(), mjd, f[3].parse().unwrap(), f[4]);
    std::fs::write(&sidecar, format!("FORMAT 1\n{shifted}\n")).unwrap();

    let mut engine = open(dir.path(), TimingConfig::default()).unwrap();
    engine.run(&observations).unwrap();

    let latest = engine.store().last_solution().unwrap();
    let bad = latest
        .notes
        .bad_toas
        .iter()
        .find(|b| b.content_id == observations[4].content_id)
        .expect("outlier rejected");
    assert_eq!(bad.stage, FilterStage::Dropout);
    assert!(!latest.notes.fitted_mjds.iter().any(|&m| (m - mjd).abs() < 1e-9));
}

#[test]
fn spin_down_is_admitted_once_the_span_allows_and_stays_free() {
    let dir = tempfile::tempdir().unwrap();
    let truth = TimingModel::parse(
        "PSRJ J0534+2200\nF0 1.9 1\nF1 -5e-16 0\nPEPOCH 59000\nPOSEPOCH 59000\nRAJ 1.46\nDECJ 0.38\n",
    )
    .unwrap();
    let mut start = truth.clone();
    start.set("F0", 1.9 + 3e-9);
    start.set("F1", 0.0);
    let mjds: Vec<f64> = (0..31).map(|i| 59000.0 + 3.0 * i as f64).collect();
    let observations = write_demo_dataset(dir.path(), &truth, &start, &mjds, &SimOptions::new(250.0, 17)).unwrap();

    let mut config = TimingConfig::default();
    config.settings.fit_params = vec!["F0".to_string(), "F1".to_string()];
    let mut engine = open(dir.path(), config).unwrap();
    engine.run(&observations).unwrap();

    let solutions = engine.store().all_solutions();
    assert_eq!(solutions.len(), 30);
    let first = solutions
        .iter()
        .position(|s| s.notes.admitted.contains(&"F1".to_string()))
        .expect("F1 admitted");
    // Not a candidate before 60 days of data.
    assert!(solutions[first].last_mjd().unwrap() >= 59060.0);
    assert!(solutions[..first].iter().all(|s| s.unfrozen_params == vec!["F0".to_string()]));
    assert!(solutions[first..].iter().all(|s| s.unfrozen_params.contains(&"F1".to_string())));

    let f1 = solutions.last().unwrap().fitted_params["F1"];
    assert!((f1 + 5e-16).abs() < 1.5e-16, "F1 = {f1:e}");
}
