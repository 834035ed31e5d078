//! The incremental timing cycle.
//!
//! One call to [`TimingEngine::advance`] moves the pipeline forward by at most
//! one batch:
//!
//! ```text
//! NoSolutionYet ─┐
//!                ├─> BatchSelected ─> Filtered ─> FitAttempted ─> Committed
//! (prior soln) ──┘         │
//!                          └─> NoFiles
//! any step ─> Failed
//! ```
//!
//! Nothing is persisted before `Committed`. New TOAs are staged in memory and
//! written together with the solution; the model file is replaced (after a
//! backup) right before that store write and restored if it fails.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigSync, TimingConfig};
use crate::domain::{
    BadToa, CLUSTERING_FALLBACK, CycleState, CycleStatus, FITTING_FAILED, Observation, ParameterSet, SolutionNotes,
    Toa, TimingSolution,
};
use crate::error::{TimingError, TimingResult};
use crate::filter::{FitContext, run_filters};
use crate::fit::{Admission, FitOutcome, FitStrategy, Fitter, admit_candidates, clustering_fit, parameter_set};
use crate::io::{InitialSnapshot, ModelFile, Preprocessor, TimingStore, extract_toas};
use crate::models::{FitParam, TimingModel};
use crate::report::fit_summary;

/// What one `advance` call did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: CycleStatus,
    /// Terminal state reached.
    pub state: CycleState,
    /// The committed solution on success.
    pub solution: Option<TimingSolution>,
    pub message: Option<String>,
}

impl CycleReport {
    fn no_files() -> Self {
        Self {
            status: CycleStatus::NoNewData,
            state: CycleState::NoFiles,
            solution: None,
            message: None,
        }
    }
}

/// The batch chosen for a cycle.
struct Batch<'a> {
    observations: &'a [Observation],
    params: ParameterSet,
    first_cycle: bool,
}

pub struct TimingEngine<S, P, F> {
    config: TimingConfig,
    store: S,
    preprocessor: P,
    fitter: F,
    model_file: ModelFile,
}

impl<S: TimingStore, P: Preprocessor, F: Fitter> TimingEngine<S, P, F> {
    /// Build an engine, checking `config` against the snapshot in `store`.
    pub fn new(config: TimingConfig, mut store: S, preprocessor: P, fitter: F, model_file: ModelFile) -> TimingResult<Self> {
        config.validate()?;
        if let ConfigSync::Store(value) = config.sync_with_stored(store.stored_config())? {
            store.put_config(value)?;
        }
        Ok(Self {
            config,
            store,
            preprocessor,
            fitter,
            model_file,
        })
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn model_file(&self) -> &ModelFile {
        &self.model_file
    }

    /// Run one cycle. Errors are logged and reported as [`CycleStatus::Error`].
    pub fn advance(&mut self, observations: &[Observation]) -> CycleReport {
        match self.try_advance(observations) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "cycle failed, nothing committed");
                CycleReport {
                    status: CycleStatus::Error,
                    state: CycleState::Failed,
                    solution: None,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Cycle until there is nothing new to fit.
    pub fn run(&mut self, observations: &[Observation]) -> TimingResult<Vec<CycleReport>> {
        let mut reports = Vec::new();
        loop {
            let report = self.try_advance(observations)?;
            let done = report.status != CycleStatus::Success;
            reports.push(report);
            if done {
                return Ok(reports);
            }
        }
    }

    /// Observations not yet covered by any solution.
    pub fn pending<'a>(&self, observations: &'a [Observation]) -> Vec<&'a Observation> {
        let covered: HashSet<&str> = self
            .store
            .all_solutions()
            .iter()
            .flat_map(|s| s.content_ids.iter().map(String::as_str))
            .collect();
        observations
            .iter()
            .filter(|o| self.config.ignore_mjds.contains(o.mjd))
            .filter(|o| !covered.contains(o.content_id.as_str()))
            .collect()
    }

    #[instrument(skip_all, fields(n_obs = observations.len()))]
    pub fn try_advance(&mut self, observations: &[Observation]) -> TimingResult<CycleReport> {
        let eligible = self.eligible(observations)?;
        let previous = self.store.last_solution().cloned();
        if previous.is_none() {
            enter(CycleState::NoSolutionYet);
        }

        let Some(batch) = self.select_batch(&eligible, previous.as_ref())? else {
            enter(CycleState::NoFiles);
            return Ok(CycleReport::no_files());
        };
        enter(CycleState::BatchSelected);
        info!(
            n_obs = batch.observations.len(),
            first_mjd = batch.observations[0].mjd,
            last_mjd = batch.observations[batch.observations.len() - 1].mjd,
            mandatory = ?batch.params.mandatory,
            candidates = ?batch.params.candidates,
            "batch selected"
        );
        if batch.params.mandatory.is_empty() {
            return Err(TimingError::Configuration(
                "no mandatory parameters to fit; check settings.fit_params".to_string(),
            ));
        }

        let snapshot = if batch.first_cycle {
            Some(self.model_file.check_initial_snapshot()?)
        } else {
            None
        };
        let input_text = self.model_file.read_text()?;
        let input_model = TimingModel::parse(&input_text)?;
        input_model.validate()?;

        let (staged, fit_toas) = self.assemble_toas(batch.observations)?;

        let mut model = input_model.clone();
        model.freeze_all();
        for (receiver, &(offset, uncertainty)) in &self.config.settings.toa_jumps {
            if offset != 0.0 && model.add_jump(receiver, offset, uncertainty) {
                info!(%receiver, offset, uncertainty, "added receiver jump to the working model");
            }
        }
        for name in &batch.params.mandatory {
            model.set_free(name.parse::<FitParam>()?, true);
        }
        if self.config.settings.reset_params {
            model.reset_frozen();
        }

        let policy = &self.config.policy;
        let ctx = run_filters(FitContext::new(fit_toas), &model, &self.fitter, policy)?;
        enter(CycleState::Filtered);

        let admission = admit_candidates(
            &self.fitter,
            &ctx.kept,
            &model,
            &batch.params.candidates,
            &policy.admission,
        )?;
        for name in &admission.admitted {
            model.set_free(name.parse::<FitParam>()?, true);
        }

        let (outcome, used_fallback) = self.fit_with_fallback(&ctx, &model)?;
        enter(CycleState::FitAttempted);

        let timestamp = next_timestamp(previous.as_ref().map(|p| p.timestamp));
        let solution = build_solution(
            timestamp,
            batch.observations,
            &ctx,
            &model,
            &input_model,
            &outcome,
            used_fallback,
            &admission,
        );
        let new_text = match &outcome {
            FitOutcome::Converged(result) => result.model.to_text(),
            FitOutcome::Failed { .. } => input_text.clone(),
        };

        let backup_dir_existed = self.model_file.backup_dir().exists();
        let mut written = Vec::new();
        let committed = self.write_model(snapshot, &new_text, previous.as_ref(), &mut written).and_then(|backup| {
            self.store.commit_cycle(staged, solution.clone())?;
            Ok(backup)
        });
        let backup = match committed {
            Ok(backup) => backup,
            Err(e) => {
                // Put the previous model back so model and store stay in step.
                if let Err(restore) = self.model_file.rollback(&input_text, &written, !backup_dir_existed) {
                    error!(error = %restore, "failed to restore timing model after commit error");
                }
                return Err(e);
            }
        };
        enter(CycleState::Committed);
        info!(
            chi2_reduced = ?solution.chi2_reduced,
            unfrozen = ?solution.unfrozen_params,
            remark = ?solution.notes.remark,
            backup = %backup.display(),
            "cycle committed"
        );

        Ok(CycleReport {
            status: CycleStatus::Success,
            state: CycleState::Committed,
            solution: Some(solution),
            message: None,
        })
    }

    /// Snapshot (first cycle), back up and replace the model file. Every file
    /// created is pushed to `written`.
    fn write_model(
        &self,
        snapshot: Option<InitialSnapshot>,
        new_text: &str,
        previous: Option<&TimingSolution>,
        written: &mut Vec<PathBuf>,
    ) -> TimingResult<PathBuf> {
        if snapshot == Some(InitialSnapshot::Missing) {
            written.push(self.model_file.write_initial_snapshot()?);
        }
        let backup = self.model_file.commit(new_text, previous.map(|p| p.timestamp))?;
        written.push(backup.clone());
        Ok(backup)
    }

    /// Drop ignored MJDs, sort, and drop duplicate content ids.
    fn eligible(&self, observations: &[Observation]) -> TimingResult<Vec<Observation>> {
        let mut seen = HashSet::new();
        let mut eligible: Vec<Observation> = Vec::with_capacity(observations.len());
        for obs in observations {
            if !self.config.ignore_mjds.contains(obs.mjd) {
                continue;
            }
            if !seen.insert(obs.content_id.as_str()) {
                warn!(content_id = %obs.content_id, "duplicate observation ignored");
                continue;
            }
            eligible.push(obs.clone());
        }
        eligible.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
        if eligible.len() < 2 {
            return Err(TimingError::Configuration(format!(
                "need at least 2 observations inside the MJD window, found {}",
                eligible.len()
            )));
        }
        Ok(eligible)
    }

    fn select_batch<'a>(
        &self,
        eligible: &'a [Observation],
        previous: Option<&TimingSolution>,
    ) -> TimingResult<Option<Batch<'a>>> {
        let settings = &self.config.settings;
        let admission = &self.config.policy.admission;

        let Some(previous) = previous else {
            let observations = &eligible[..2];
            return Ok(Some(Batch {
                observations,
                params: parameter_set(admission, &settings.fit_params, None, span(observations)),
                first_cycle: true,
            }));
        };

        let last_mjd = previous.last_mjd().ok_or_else(|| {
            TimingError::DataIntegrity("latest timing solution lists no observations".to_string())
        })?;
        let next = eligible
            .iter()
            .position(|o| o.mjd >= last_mjd + settings.fit_every_n_days && o.mjd > last_mjd);
        let Some(end) = next else {
            let stuck: Vec<f64> = eligible
                .iter()
                .filter(|o| !previous.content_ids.contains(&o.content_id))
                .map(|o| o.mjd)
                .collect();
            if !stuck.is_empty() {
                warn!(
                    count = stuck.len(),
                    mjds = ?stuck,
                    "observations not represented in any solution; they may need reprocessing"
                );
            }
            debug!(last_mjd, "no observation past the next fit boundary");
            return Ok(None);
        };

        let observations = &eligible[..=end];
        Ok(Some(Batch {
            observations,
            params: parameter_set(admission, &settings.fit_params, Some(previous), span(observations)),
            first_cycle: false,
        }))
    }

    /// Extract TOAs for observations the store has not seen, then gather the
    /// valid TOA of every batch observation.
    ///
    /// Returns `(staged, fit_input)`. Staged TOAs are only persisted on commit.
    fn assemble_toas(&self, batch: &[Observation]) -> TimingResult<(Vec<Toa>, Vec<Toa>)> {
        let fresh: Vec<Observation> = batch
            .iter()
            .filter(|o| !self.store.toa_exists(&o.content_id))
            .cloned()
            .collect();
        let staged = extract_toas(&self.preprocessor, &fresh)?;
        debug!(fresh = fresh.len(), "extracted TOAs");

        let by_id: HashMap<&str, &Toa> = staged.iter().map(|t| (t.content_id.as_str(), t)).collect();
        let mut fit_input = Vec::with_capacity(batch.len());
        for obs in batch {
            let toa = by_id
                .get(obs.content_id.as_str())
                .copied()
                .or_else(|| self.store.get_toa(&obs.content_id));
            match toa {
                Some(toa) if toa.is_valid() => fit_input.push(toa.clone()),
                Some(_) => debug!(content_id = %obs.content_id, "skipping invalid TOA"),
                None => warn!(content_id = %obs.content_id, "no TOA record for observation"),
            }
        }
        Ok((staged, fit_input))
    }

    /// Direct fit, then the clustering fallback if it failed or fit badly.
    ///
    /// The fallback wins when the direct fit failed or when its reduced χ² is
    /// not worse.
    fn fit_with_fallback(&self, ctx: &FitContext, model: &TimingModel) -> TimingResult<(FitOutcome, bool)> {
        let n_free = model.free_params()?.len();
        let strategy = FitStrategy::resolve(self.config.settings.fit_strategy, n_free);
        let direct = self.fitter.fit(&ctx.kept, model, strategy)?;

        let threshold = self.config.policy.chi2r_fallback_threshold;
        match &direct {
            FitOutcome::Converged(result) if result.chi2_reduced <= threshold => return Ok((direct, false)),
            FitOutcome::Converged(result) => {
                warn!(chi2_reduced = result.chi2_reduced, threshold, "poor direct fit, trying clustering fallback");
            }
            FitOutcome::Failed { reason } => warn!(%reason, "direct fit failed, trying clustering fallback"),
        }

        let fallback = clustering_fit(
            &self.fitter,
            &ctx.kept,
            model,
            self.config.policy.cluster_gap_mad_multiple,
        )?;
        Ok(choose(direct, fallback.outcome))
    }
}

/// Pick between the direct fit and the clustering fallback.
fn choose(direct: FitOutcome, fallback: FitOutcome) -> (FitOutcome, bool) {
    match (direct, fallback) {
        (FitOutcome::Failed { .. }, FitOutcome::Converged(f)) => (FitOutcome::Converged(f), true),
        (FitOutcome::Converged(d), FitOutcome::Converged(f)) if f.chi2_reduced <= d.chi2_reduced => {
            (FitOutcome::Converged(f), true)
        }
        (direct, fallback) => {
            if let FitOutcome::Failed { reason } = &fallback {
                debug!(%reason, "clustering fallback did not converge");
            }
            (direct, false)
        }
    }
}

fn enter(state: CycleState) {
    debug!(state = ?state, "cycle state");
}

fn span(observations: &[Observation]) -> f64 {
    match (observations.first(), observations.last()) {
        (Some(first), Some(last)) => last.mjd - first.mjd,
        _ => 0.0,
    }
}

/// `now`, or 1 ms past `previous` if the clock has not moved beyond it.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if now <= previous => previous + Duration::milliseconds(1),
        _ => now,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_solution(
    timestamp: DateTime<Utc>,
    batch: &[Observation],
    ctx: &FitContext,
    model: &TimingModel,
    input_model: &TimingModel,
    outcome: &FitOutcome,
    used_fallback: bool,
    admission: &Admission,
) -> TimingSolution {
    let bad_toas = ctx
        .rejected
        .iter()
        .map(|r| BadToa {
            content_id: r.toa.content_id.clone(),
            mjd: r.toa.mjd,
            stage: r.stage,
            residual_us: r.residual_us,
            error_us: r.toa.error_us,
        })
        .collect();
    let mut notes = SolutionNotes {
        bad_toas,
        admitted: admission.admitted.clone(),
        admission_p_value: admission.p_value,
        ..SolutionNotes::default()
    };
    if used_fallback {
        notes.remark.push(CLUSTERING_FALLBACK.to_string());
    }

    let mut solution = TimingSolution {
        timestamp,
        content_ids: batch.iter().map(|o| o.content_id.clone()).collect(),
        obs_mjds: batch.iter().map(|o| o.mjd).collect(),
        unfrozen_params: model.free_param_names(),
        residuals: Default::default(),
        chi2: None,
        chi2_reduced: None,
        fitted_params: input_model.values(),
        notes,
    };
    match outcome {
        FitOutcome::Converged(result) => {
            solution.residuals = result.residuals.clone();
            solution.chi2 = Some(result.chi2);
            solution.chi2_reduced = Some(result.chi2_reduced);
            solution.fitted_params = result.model.values();
            solution.notes.fitted_model = result.model.to_text();
            solution.notes.fitted_summary = fit_summary(result);
            solution.notes.fitted_mjds = result.mjds.clone();
        }
        FitOutcome::Failed { reason } => {
            warn!(%reason, "fit failed, committing the input model unchanged");
            solution.notes.remark.push(FITTING_FAILED.to_string());
            solution.notes.fitted_model = input_model.to_text();
        }
    }
    solution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Residuals;
    use crate::fit::{FitResult, PhaseFitter};
    use crate::io::{MemoryStore, TimFilePreprocessor};
    use crate::sim::{SimOptions, write_demo_dataset};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn truth() -> TimingModel {
        TimingModel::parse("PSRJ J1234+0100\nF0 1.7 1\nF1 -2e-15 0\nPEPOCH 59000\nRAJ 3.3\nDECJ 0.02\n").unwrap()
    }

    fn start() -> TimingModel {
        let mut m = truth();
        m.set("F0", 1.7 + 2e-9);
        m
    }

    fn dataset(dir: &Path, mjds: &[f64]) -> Vec<Observation> {
        write_demo_dataset(dir, &truth(), &start(), mjds, &SimOptions::new(200.0, 5)).unwrap()
    }

    fn engine<F: Fitter>(dir: &Path, fitter: F) -> TimingEngine<MemoryStore, TimFilePreprocessor, F> {
        TimingEngine::new(
            TimingConfig::default(),
            MemoryStore::new(),
            TimFilePreprocessor,
            fitter,
            ModelFile::in_dir(dir),
        )
        .unwrap()
    }

    #[test]
    fn first_cycle_fits_the_two_earliest_observations() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59001.0, 59000.0, 59002.0]);
        let mut engine = engine(dir.path(), PhaseFitter::default());

        let report = engine.advance(&observations);
        assert_eq!(report.status, CycleStatus::Success);
        let solution = report.solution.unwrap();
        assert_eq!(solution.obs_mjds, vec![59000.0, 59001.0]);
        assert_eq!(solution.unfrozen_params, vec!["F0".to_string()]);
        assert!(engine.model_file().initial_snapshot_path().exists());
        assert_eq!(engine.store().toas().len(), 2);
    }

    #[test]
    fn only_observations_inside_the_window_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[58990.0, 59000.0, 59001.0, 59002.0, 59003.0]);
        let mut config = TimingConfig::default();
        config.ignore_mjds.earlier_than = 59000.0;
        config.ignore_mjds.later_than = Some(59002.0);
        let mut engine = TimingEngine::new(
            config,
            MemoryStore::new(),
            TimFilePreprocessor,
            PhaseFitter::default(),
            ModelFile::in_dir(dir.path()),
        )
        .unwrap();

        assert_eq!(engine.pending(&observations).len(), 3);
        let reports = engine.run(&observations).unwrap();
        assert_eq!(reports.last().unwrap().status, CycleStatus::NoNewData);
        let last = engine.store().last_solution().unwrap();
        assert_eq!(last.obs_mjds, vec![59000.0, 59001.0, 59002.0]);
        assert!(engine.pending(&observations).is_empty());
    }

    #[test]
    fn configured_jumps_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0, 59002.0]);
        let mut config = TimingConfig::default();
        config.settings.toa_jumps.insert("chime".into(), (0.0, 0.0));
        config.settings.toa_jumps.insert("gbt".into(), (0.001, 1e-6));
        let mut engine = TimingEngine::new(
            config,
            MemoryStore::new(),
            TimFilePreprocessor,
            PhaseFitter::default(),
            ModelFile::in_dir(dir.path()),
        )
        .unwrap();

        engine.run(&observations).unwrap();
        assert_eq!(engine.store().all_solutions().len(), 2);
        let model = engine.model_file().read_model().unwrap();
        let receivers: Vec<&str> = model.jumps().map(|j| j.receiver.as_str()).collect();
        assert_eq!(receivers, ["gbt"]);
        assert_eq!(model.jumps().next().unwrap().offset, 0.001);
    }

    /// Accepts everything except the final cycle commit.
    #[derive(Default)]
    struct RefusingStore {
        inner: MemoryStore,
        refuse: bool,
    }

    impl TimingStore for RefusingStore {
        fn append_toa(&mut self, toa: Toa) -> TimingResult<()> {
            self.inner.append_toa(toa)
        }
        fn toa_exists(&self, content_id: &str) -> bool {
            self.inner.toa_exists(content_id)
        }
        fn get_toa(&self, content_id: &str) -> Option<&Toa> {
            self.inner.get_toa(content_id)
        }
        fn append_solution(&mut self, solution: TimingSolution) -> TimingResult<()> {
            self.inner.append_solution(solution)
        }
        fn last_solution(&self) -> Option<&TimingSolution> {
            self.inner.last_solution()
        }
        fn all_solutions(&self) -> &[TimingSolution] {
            self.inner.all_solutions()
        }
        fn stored_config(&self) -> Option<&serde_json::Value> {
            self.inner.stored_config()
        }
        fn put_config(&mut self, config: serde_json::Value) -> TimingResult<()> {
            self.inner.put_config(config)
        }
        fn commit_cycle(&mut self, toas: Vec<Toa>, solution: TimingSolution) -> TimingResult<()> {
            if self.refuse {
                return Err(TimingError::Store("disk full".into()));
            }
            self.inner.commit_cycle(toas, solution)
        }
    }

    fn refusing_engine(dir: &Path, store: RefusingStore) -> TimingEngine<RefusingStore, TimFilePreprocessor, PhaseFitter> {
        TimingEngine::new(
            TimingConfig::default(),
            store,
            TimFilePreprocessor,
            PhaseFitter::default(),
            ModelFile::in_dir(dir),
        )
        .unwrap()
    }

    fn snapshot_files(dir: &Path) -> Vec<(std::path::PathBuf, Vec<u8>)> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(next) = pending.pop() {
            for entry in std::fs::read_dir(&next).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    files.push((path.clone(), Vec::new()));
                    pending.push(path);
                } else {
                    let bytes = std::fs::read(&path).unwrap();
                    files.push((path, bytes));
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn refused_first_commit_leaves_the_directory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0, 59002.0]);
        let before = snapshot_files(dir.path());

        let store = RefusingStore { refuse: true, ..Default::default() };
        let mut engine = refusing_engine(dir.path(), store);
        let err = engine.try_advance(&observations).unwrap_err();
        assert!(matches!(err, TimingError::Store(_)));
        assert_eq!(snapshot_files(dir.path()), before);
        assert!(engine.store().all_solutions().is_empty());
    }

    #[test]
    fn refused_later_commit_removes_only_its_backup() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0, 59002.0]);
        let mut engine = refusing_engine(dir.path(), RefusingStore::default());
        engine.try_advance(&observations).unwrap();
        let before = snapshot_files(dir.path());

        engine.store.refuse = true;
        assert_eq!(engine.advance(&observations).status, CycleStatus::Error);
        assert_eq!(snapshot_files(dir.path()), before);
        assert_eq!(engine.model_file().backups().unwrap().len(), 1);
    }

    #[test]
    fn next_batch_stops_at_the_boundary_then_reports_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0, 59001.4, 59002.0]);
        let mut engine = engine(dir.path(), PhaseFitter::default());

        assert_eq!(engine.advance(&observations).status, CycleStatus::Success);
        let second = engine.advance(&observations).solution.unwrap();
        assert_eq!(second.obs_mjds, vec![59000.0, 59001.0, 59001.4, 59002.0]);
        assert!(engine.pending(&observations).is_empty());
        let third = engine.advance(&observations);
        assert_eq!(third.status, CycleStatus::NoNewData);
        assert_eq!(third.state, CycleState::NoFiles);
        assert_eq!(engine.store().all_solutions().len(), 2);
    }

    #[test]
    fn too_few_observations_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0]);
        let mut engine = engine(dir.path(), PhaseFitter::default());
        let report = engine.advance(&observations);
        assert_eq!(report.status, CycleStatus::Error);
        assert_eq!(report.state, CycleState::Failed);
        assert!(engine.store().all_solutions().is_empty());
    }

    #[test]
    fn nothing_to_fit_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0]);
        let mut config = TimingConfig::default();
        config.policy.admission.always_fit.clear();
        let mut engine = TimingEngine::new(
            config,
            MemoryStore::new(),
            TimFilePreprocessor,
            PhaseFitter::default(),
            ModelFile::in_dir(dir.path()),
        )
        .unwrap();

        let err = engine.try_advance(&observations).unwrap_err();
        assert!(matches!(err, TimingError::Configuration(_)));
        assert!(engine.store().all_solutions().is_empty());
        assert!(!engine.model_file().initial_snapshot_path().exists());
    }

    #[test]
    fn edited_model_before_first_cycle_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0]);
        let model_file = ModelFile::in_dir(dir.path());
        model_file.write_initial_snapshot().unwrap();
        std::fs::write(model_file.path(), start().to_text() + "# edited\n").unwrap();

        let mut engine = engine(dir.path(), PhaseFitter::default());
        let report = engine.advance(&observations);
        assert_eq!(report.status, CycleStatus::Error);
        assert!(report.message.unwrap().contains("initial snapshot"));
        assert!(engine.store().all_solutions().is_empty());
        assert!(engine.store().toas().is_empty());
    }

    /// Direct fits always fail; cluster fits succeed with a fixed χ²_r.
    struct ScriptedFitter {
        calls: AtomicUsize,
    }

    impl Fitter for ScriptedFitter {
        fn fit(&self, toas: &[Toa], model: &TimingModel, _: FitStrategy) -> TimingResult<FitOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Ok(FitOutcome::failed("scripted failure"));
            }
            Ok(FitOutcome::Converged(FitResult {
                model: model.clone(),
                free_params: model.free_params()?,
                mjds: toas.iter().map(|t| t.mjd).collect(),
                residuals: Residuals {
                    val: vec![0.0; toas.len()],
                    err: vec![1.0; toas.len()],
                },
                chi2: 2.1,
                chi2_reduced: 2.1,
                dof: 1,
                iterations: 1,
            }))
        }
    }

    #[test]
    fn failed_direct_fit_falls_back_to_clustering() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0]);
        let mut engine = engine(dir.path(), ScriptedFitter { calls: AtomicUsize::new(0) });

        let solution = engine.advance(&observations).solution.unwrap();
        assert!(solution.has_remark(CLUSTERING_FALLBACK));
        assert!(!solution.fit_failed());
        assert_eq!(solution.chi2_reduced, Some(2.1));
    }

    struct FailingFitter;

    impl Fitter for FailingFitter {
        fn fit(&self, _: &[Toa], _: &TimingModel, _: FitStrategy) -> TimingResult<FitOutcome> {
            Ok(FitOutcome::failed("never converges"))
        }
    }

    #[test]
    fn failed_fit_commits_the_input_model_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let observations = dataset(dir.path(), &[59000.0, 59001.0]);
        let before = std::fs::read_to_string(dir.path().join("pulsar.par")).unwrap();
        let mut engine = engine(dir.path(), FailingFitter);

        let report = engine.advance(&observations);
        assert_eq!(report.status, CycleStatus::Success);
        let solution = report.solution.unwrap();
        assert!(solution.fit_failed());
        assert_eq!(solution.chi2, None);
        assert_eq!(std::fs::read_to_string(dir.path().join("pulsar.par")).unwrap(), before);
        assert_eq!(engine.model_file().backups().unwrap().len(), 1);
    }

    #[test]
    fn choose_prefers_fallback_only_when_not_worse() {
        let result = |chi2r: f64| {
            FitOutcome::Converged(FitResult {
                model: truth(),
                free_params: vec![FitParam::F0],
                mjds: vec![],
                residuals: Residuals::default(),
                chi2: chi2r,
                chi2_reduced: chi2r,
                dof: 1,
                iterations: 1,
            })
        };
        assert!(choose(result(20.0), result(12.0)).1);
        assert!(!choose(result(20.0), result(25.0)).1);
        assert!(!choose(result(20.0), FitOutcome::failed("x")).1);
        assert!(choose(FitOutcome::failed("x"), result(2.1)).1);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let future = Utc::now() + Duration::hours(1);
        assert_eq!(next_timestamp(Some(future)), future + Duration::milliseconds(1));
        assert!(next_timestamp(None) <= Utc::now());
    }
}
