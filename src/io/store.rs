//! Persistent TOA and solution store.
//!
//! Holds:
//! - one TOA record per observation content id (placeholders included)
//! - the append-only list of timing solutions, ordered by timestamp
//! - the configuration snapshot the pipeline was started with
//!
//! `MemoryStore` keeps everything in memory; `FileStore` mirrors it into a
//! single JSON document rewritten atomically after every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Toa, TimingSolution};
use crate::error::{TimingError, TimingResult};
use crate::io::write_atomic;

const STORE_VERSION: u32 = 1;

pub trait TimingStore {
    fn append_toa(&mut self, toa: Toa) -> TimingResult<()>;

    fn append_toas(&mut self, toas: Vec<Toa>) -> TimingResult<()> {
        for toa in toas {
            self.append_toa(toa)?;
        }
        Ok(())
    }

    fn toa_exists(&self, content_id: &str) -> bool;

    fn get_toa(&self, content_id: &str) -> Option<&Toa>;

    fn append_solution(&mut self, solution: TimingSolution) -> TimingResult<()>;

    /// Most recent solution by timestamp.
    fn last_solution(&self) -> Option<&TimingSolution>;

    fn all_solutions(&self) -> &[TimingSolution];

    fn stored_config(&self) -> Option<&Value>;

    fn put_config(&mut self, config: Value) -> TimingResult<()>;

    /// Record one cycle: its newly extracted TOAs, then its solution.
    fn commit_cycle(&mut self, toas: Vec<Toa>, solution: TimingSolution) -> TimingResult<()> {
        self.append_toas(toas)?;
        self.append_solution(solution)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    toas: Vec<Toa>,
    #[serde(default)]
    solutions: Vec<TimingSolution>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            config: None,
            toas: Vec::new(),
            solutions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: StoreState,
    index: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_state(state: StoreState) -> TimingResult<Self> {
        let StoreState {
            version,
            config,
            toas,
            solutions,
        } = state;
        let mut store = Self {
            state: StoreState {
                version,
                config,
                toas: Vec::with_capacity(toas.len()),
                solutions: Vec::with_capacity(solutions.len()),
            },
            index: HashMap::new(),
        };
        // Re-validate on load: a hand-edited file must not break the invariants.
        for toa in toas {
            store.append_toa(toa)?;
        }
        for solution in solutions {
            store.append_solution(solution)?;
        }
        Ok(store)
    }

    pub fn toas(&self) -> &[Toa] {
        &self.state.toas
    }
}

impl TimingStore for MemoryStore {
    fn append_toa(&mut self, toa: Toa) -> TimingResult<()> {
        if self.index.contains_key(&toa.content_id) {
            return Err(TimingError::Store(format!(
                "a TOA for '{}' is already stored",
                toa.content_id
            )));
        }
        self.index.insert(toa.content_id.clone(), self.state.toas.len());
        self.state.toas.push(toa);
        Ok(())
    }

    fn toa_exists(&self, content_id: &str) -> bool {
        self.index.contains_key(content_id)
    }

    fn get_toa(&self, content_id: &str) -> Option<&Toa> {
        self.index.get(content_id).map(|&i| &self.state.toas[i])
    }

    fn append_solution(&mut self, solution: TimingSolution) -> TimingResult<()> {
        if let Some(last) = self.state.solutions.last() {
            if solution.timestamp <= last.timestamp {
                return Err(TimingError::Store(format!(
                    "solution timestamp {} is not after the latest stored {}",
                    solution.timestamp, last.timestamp
                )));
            }
        }
        self.state.solutions.push(solution);
        Ok(())
    }

    fn last_solution(&self) -> Option<&TimingSolution> {
        self.state.solutions.last()
    }

    fn all_solutions(&self) -> &[TimingSolution] {
        &self.state.solutions
    }

    fn stored_config(&self) -> Option<&Value> {
        self.state.config.as_ref()
    }

    fn put_config(&mut self, config: Value) -> TimingResult<()> {
        self.state.config = Some(config);
        Ok(())
    }
}

/// A [`MemoryStore`] persisted to one JSON file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> TimingResult<Self> {
        let path = path.into();
        let inner = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| TimingError::io(&path, e))?;
            let state: StoreState = serde_json::from_str(&text).map_err(|e| TimingError::json(&path, e))?;
            if state.version != STORE_VERSION {
                return Err(TimingError::Store(format!(
                    "'{}' has store version {}, expected {STORE_VERSION}",
                    path.display(),
                    state.version
                )));
            }
            MemoryStore::from_state(state)?
        } else {
            MemoryStore::new()
        };
        debug!(
            path = %path.display(),
            toas = inner.state.toas.len(),
            solutions = inner.state.solutions.len(),
            "opened TOA store"
        );
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn toas(&self) -> &[Toa] {
        self.inner.toas()
    }

    fn flush(&self) -> TimingResult<()> {
        let json = serde_json::to_vec_pretty(&self.inner.state).map_err(|e| TimingError::json(&self.path, e))?;
        write_atomic(&self.path, &json)
    }

    /// Apply `op` to a copy and persist it; the in-memory state only changes
    /// once the file write succeeded.
    fn mutate(&mut self, op: impl FnOnce(&mut MemoryStore) -> TimingResult<()>) -> TimingResult<()> {
        let mut next = self.inner.clone();
        op(&mut next)?;
        let previous = std::mem::replace(&mut self.inner, next);
        if let Err(e) = self.flush() {
            self.inner = previous;
            return Err(e);
        }
        Ok(())
    }
}

impl TimingStore for FileStore {
    fn append_toa(&mut self, toa: Toa) -> TimingResult<()> {
        self.mutate(|s| s.append_toa(toa))
    }

    fn append_toas(&mut self, toas: Vec<Toa>) -> TimingResult<()> {
        if toas.is_empty() {
            return Ok(());
        }
        self.mutate(|s| s.append_toas(toas))
    }

    fn toa_exists(&self, content_id: &str) -> bool {
        self.inner.toa_exists(content_id)
    }

    fn get_toa(&self, content_id: &str) -> Option<&Toa> {
        self.inner.get_toa(content_id)
    }

    fn append_solution(&mut self, solution: TimingSolution) -> TimingResult<()> {
        self.mutate(|s| s.append_solution(solution))
    }

    fn last_solution(&self) -> Option<&TimingSolution> {
        self.inner.last_solution()
    }

    fn all_solutions(&self) -> &[TimingSolution] {
        self.inner.all_solutions()
    }

    fn stored_config(&self) -> Option<&Value> {
        self.inner.stored_config()
    }

    fn put_config(&mut self, config: Value) -> TimingResult<()> {
        self.mutate(|s| s.put_config(config))
    }

    fn commit_cycle(&mut self, toas: Vec<Toa>, solution: TimingSolution) -> TimingResult<()> {
        self.mutate(|s| s.commit_cycle(toas, solution))
    }
}
