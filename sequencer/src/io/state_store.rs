//! State storage for a plan instance (`state.json`).
//!
//! The store is the only component that reads or writes the persisted
//! document. Every load validates against the JSON Schema and the semantic
//! invariants; every save is a temp-file + rename so readers never observe a
//! partial write. File writers serialize on an exclusive lock held on a
//! sidecar `state.lock`, so a compare-and-swap commit is atomic across
//! threads and processes.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::validator_for;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::core::invariants::validate_invariants;
use crate::error::{SchemaError, StaleStateError};
use crate::io::init::PlanPaths;
use crate::state::SequencerState;

const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/state.schema.json"
));

/// Injected handle to one plan instance's persisted state.
pub trait StateStore {
    /// Human-readable identity of the backing location (for logs and errors).
    fn location(&self) -> String;

    /// Load the state, or `None` if no plan is persisted.
    fn load(&self) -> Result<Option<SequencerState>>;

    /// Atomically replace the persisted state.
    fn save(&self, state: &SequencerState) -> Result<()>;

    /// Directory for per-attempt executor logs, if this store keeps any.
    fn attempts_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Path of the backing document, for runners that work on files.
    fn state_path(&self) -> Option<PathBuf> {
        None
    }

    /// Compare-and-swap: write `next` only if the stored state still equals
    /// `expected`. Fails with [`StaleStateError`] otherwise.
    fn commit(&self, expected: &SequencerState, next: &SequencerState) -> Result<()> {
        let current = self.load()?;
        if current.as_ref() != Some(expected) {
            return Err(StaleStateError {
                location: self.location(),
            }
            .into());
        }
        if expected == next {
            return Ok(());
        }
        self.save(next)
    }
}

/// [`StateStore::commit`], mapping a lost race to `Ok(false)`.
pub fn commit_if_current(
    store: &dyn StateStore,
    expected: &SequencerState,
    next: &SequencerState,
) -> Result<bool> {
    match store.commit(expected, next) {
        Ok(()) => Ok(true),
        Err(err) if err.downcast_ref::<StaleStateError>().is_some() => {
            debug!(store = %store.location(), "commit lost to a concurrent writer");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Parse and validate a raw state document: schema conformance + invariants.
pub fn validate_state(raw: &str, location: &str) -> Result<SequencerState, SchemaError> {
    let schema_error = |violations: Vec<String>| SchemaError {
        location: location.to_string(),
        violations,
    };
    let value: Value =
        serde_json::from_str(raw).map_err(|err| schema_error(vec![format!("parse json: {err}")]))?;

    let messages = schema_violations(&value);
    if !messages.is_empty() {
        return Err(schema_error(messages));
    }

    let state: SequencerState = serde_json::from_value(value)
        .map_err(|err| schema_error(vec![format!("deserialize state: {err}")]))?;
    let errors = validate_invariants(&state);
    if !errors.is_empty() {
        return Err(schema_error(errors));
    }
    Ok(state)
}

fn schema_violations(instance: &Value) -> Vec<String> {
    let schema: Value = match serde_json::from_str(STATE_SCHEMA) {
        Ok(schema) => schema,
        Err(err) => return vec![format!("embedded state schema is invalid json: {err}")],
    };
    let compiled = match validator_for(&schema) {
        Ok(compiled) => compiled,
        Err(err) => return vec![format!("embedded state schema is invalid: {err}")],
    };
    compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

fn serialize_checked(state: &SequencerState, location: &str) -> Result<String> {
    let errors = validate_invariants(state);
    if !errors.is_empty() {
        return Err(SchemaError {
            location: location.to_string(),
            violations: errors,
        }
        .into());
    }
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    Ok(buf)
}

/// File-backed store: one `state.json` per plan instance.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    paths: PlanPaths,
}

impl FileStateStore {
    pub fn new(paths: PlanPaths) -> Self {
        Self { paths }
    }

    /// Store for an explicit state file path.
    pub fn at(state_path: impl Into<PathBuf>) -> Self {
        Self::new(PlanPaths::for_state_file(state_path))
    }

    pub fn paths(&self) -> &PlanPaths {
        &self.paths
    }

    /// Sidecar file whose exclusive lock guards every write.
    pub fn lock_path(&self) -> PathBuf {
        self.paths.state_path.with_extension("lock")
    }

    /// Block until this process holds the writer lock. Released on drop.
    fn lock(&self) -> Result<File> {
        let lock_path = self.lock_path();
        fs::create_dir_all(state_dir(&lock_path))
            .with_context(|| format!("create directory for {}", lock_path.display()))?;
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open lock {}", lock_path.display()))?;
        file.lock()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        Ok(file)
    }

    fn write_locked(&self, state: &SequencerState) -> Result<()> {
        let path = &self.paths.state_path;
        debug!(path = %path.display(), current_step = state.current_step, status = ?state.status, "writing state");
        let buf = serialize_checked(state, &self.location())?;
        write_atomic(path, &buf)
    }

    /// Move the current document into `archive/` under `label`.
    ///
    /// Returns the archive path, or `None` if there was nothing to archive.
    pub fn archive(&self, label: &str) -> Result<Option<PathBuf>> {
        let _guard = self.lock()?;
        if !self.paths.state_path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.paths.archive_dir).with_context(|| {
            format!("create directory {}", self.paths.archive_dir.display())
        })?;
        let target = self.paths.archive_dir.join(format!("{label}.json"));
        fs::rename(&self.paths.state_path, &target).with_context(|| {
            format!(
                "archive {} to {}",
                self.paths.state_path.display(),
                target.display()
            )
        })?;
        info!(archive = %target.display(), "state archived");
        Ok(Some(target))
    }
}

impl StateStore for FileStateStore {
    fn location(&self) -> String {
        self.paths.state_path.display().to_string()
    }

    fn load(&self) -> Result<Option<SequencerState>> {
        let path = &self.paths.state_path;
        debug!(path = %path.display(), "loading state");
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state persisted");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read state {}", path.display()));
            }
        };
        let state = validate_state(&contents, &self.location())?;
        debug!(
            current_step = state.current_step,
            status = ?state.status,
            "state loaded"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &SequencerState) -> Result<()> {
        let _guard = self.lock()?;
        self.write_locked(state)
    }

    fn commit(&self, expected: &SequencerState, next: &SequencerState) -> Result<()> {
        let _guard = self.lock()?;
        if self.load()?.as_ref() != Some(expected) {
            return Err(StaleStateError {
                location: self.location(),
            }
            .into());
        }
        if expected == next {
            return Ok(());
        }
        self.write_locked(next)
    }

    fn attempts_dir(&self) -> Option<PathBuf> {
        Some(self.paths.attempts_dir.clone())
    }

    fn state_path(&self) -> Option<PathBuf> {
        Some(self.paths.state_path.clone())
    }
}

/// Directory holding `path`; a bare file name lives in `.`.
fn state_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = state_dir(path);
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp state in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp state {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// In-memory store for tests and embedding. Holds the serialized document so
/// loads go through the same validation as files.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    id: String,
    document: RefCell<Option<String>>,
}

impl MemoryStateStore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: RefCell::new(None),
        }
    }

    pub fn with_state(id: impl Into<String>, state: &SequencerState) -> Result<Self> {
        let store = Self::new(id);
        store.save(state)?;
        Ok(store)
    }

    /// Replace the raw document, bypassing validation (simulates hand edits).
    pub fn put_raw(&self, raw: impl Into<String>) {
        *self.document.borrow_mut() = Some(raw.into());
    }

    pub fn raw(&self) -> Option<String> {
        self.document.borrow().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn location(&self) -> String {
        format!("memory:{}", self.id)
    }

    fn load(&self) -> Result<Option<SequencerState>> {
        let document = self.document.borrow();
        match document.as_deref() {
            None => Ok(None),
            Some(raw) => Ok(Some(validate_state(raw, &self.location())?)),
        }
    }

    fn save(&self, state: &SequencerState) -> Result<()> {
        let buf = serialize_checked(state, &self.location())?;
        *self.document.borrow_mut() = Some(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::state::{StepRun, StepStatus};
    use crate::test_support::two_step_state;

    #[test]
    fn missing_file_loads_as_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::at(temp.path().join("state.json"));
        assert!(store.load().expect("load").is_none());
    }

    /// Verifies write -> read preserves all fields and leaves no temp file behind.
    #[test]
    fn file_store_round_trips_atomically() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::at(temp.path().join("state.json"));

        let mut state = two_step_state(2);
        state.step_runs.insert(
            "step-1".to_string(),
            StepRun {
                status: StepStatus::Failed,
                tries: 1,
                error: Some("boom".to_string()),
                ..StepRun::default()
            },
        );
        state.add_artifacts("step-1", vec!["out/report.md".to_string()]);

        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), Some(state));

        let mut names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["state.json", "state.lock"]);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let err = validate_state(r#"{"plan": {"steps": {}}, "stepQueue": []}"#, "test")
            .expect_err("schema error");
        let msg = err.to_string();
        assert!(msg.contains("currentStep"), "{msg}");
        assert!(msg.contains("status"), "{msg}");
    }

    #[test]
    fn rejects_queue_entry_missing_from_plan() {
        let raw = r#"{
            "plan": {"steps": {"step-1": {"title": "A", "instruction": "a"}}},
            "stepQueue": ["step-1", "step-2"],
            "currentStep": 0,
            "status": "IN_PROGRESS"
        }"#;
        let err = validate_state(raw, "test").expect_err("schema error");
        assert!(err.violations.iter().any(|v| v.contains("step-2")));
    }

    #[test]
    fn rejects_unknown_status_string() {
        let raw = r#"{
            "plan": {"steps": {"step-1": {"title": "A", "instruction": "a"}}},
            "stepQueue": ["step-1"],
            "currentStep": 0,
            "stepRuns": {"step-1": {"status": "RUNNING", "tries": 0}},
            "status": "IN_PROGRESS"
        }"#;
        assert!(validate_state(raw, "test").is_err());
    }

    #[test]
    fn schema_error_leaves_file_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        let store = FileStateStore::at(&path);

        let err = store.load().expect_err("invalid");
        assert!(err.downcast_ref::<SchemaError>().is_some());
        assert_eq!(fs::read_to_string(&path).expect("read"), "{ not json");
    }

    #[test]
    fn commit_refuses_stale_expectation() {
        let store = MemoryStateStore::with_state("plan", &two_step_state(0)).expect("store");
        let stale = store.load().expect("load").expect("state");

        let mut newer = stale.clone();
        newer.current_step = 1;
        store.commit(&stale, &newer).expect("first commit");

        let mut loser = stale.clone();
        loser.blockers.insert("step-1".to_string());
        let err = store.commit(&stale, &loser).expect_err("stale");
        assert!(err.downcast_ref::<StaleStateError>().is_some());
        assert_eq!(store.load().expect("load"), Some(newer));
    }

    /// Verifies overlapping writers that loaded the same state cannot both
    /// commit: exactly one wins and its update is the one on disk.
    #[test]
    fn concurrent_file_commits_admit_a_single_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        FileStateStore::at(&path)
            .save(&two_step_state(0))
            .expect("save");

        for round in 0..5 {
            let expected = FileStateStore::at(&path)
                .load()
                .expect("load")
                .expect("state");
            let writers = 4;
            let barrier = Barrier::new(writers);
            let results: Vec<bool> = thread::scope(|scope| {
                let handles: Vec<_> = (0..writers)
                    .map(|writer| {
                        let store = FileStateStore::at(&path);
                        let expected = &expected;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            let mut next = expected.clone();
                            next.add_artifacts(
                                &format!("round-{round}"),
                                vec![format!("writer-{writer}")],
                            );
                            barrier.wait();
                            commit_if_current(&store, expected, &next).expect("commit")
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().expect("join"))
                    .collect()
            });

            let winners: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, won)| **won)
                .map(|(writer, _)| writer)
                .collect();
            assert_eq!(winners.len(), 1, "round {round}: {results:?}");
            let saved = FileStateStore::at(&path)
                .load()
                .expect("load")
                .expect("state");
            assert_eq!(
                saved.artifacts[&format!("round-{round}")],
                vec![format!("writer-{}", winners[0])]
            );
        }
    }

    #[test]
    fn archive_moves_document_aside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::at(temp.path().join("state.json"));
        assert!(store.archive("first").expect("archive").is_none());

        store.save(&two_step_state(0)).expect("save");
        let archived = store.archive("first").expect("archive").expect("path");
        assert!(archived.is_file());
        assert!(store.load().expect("load").is_none());
    }
}
