//! Append-only result store backed by the batch directory.
//!
//! Each run's record is kept in memory and persisted as
//! `<batch>/<run_id>/result.json`. A run identifier can be written once; a
//! second write is rejected and leaves the stored record untouched.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::result::RunResult;
use crate::core::types::RunId;
use crate::error::StoreError;
use crate::io::run_log::{BatchPaths, RESULT_FILE};

/// Names tried by [`ResultStore::create_unique`] before giving up.
const MAX_BATCH_ATTEMPTS: u32 = 100;

#[derive(Debug)]
pub struct ResultStore {
    batch: BatchPaths,
    records: Mutex<BTreeMap<RunId, RunResult>>,
}

impl ResultStore {
    /// Store for a new batch. Fails if the batch directory already exists.
    pub fn create(batch: BatchPaths) -> Result<Self> {
        if let Some(parent) = batch.dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create runs dir {}", parent.display()))?;
        }
        fs::create_dir(&batch.dir)
            .with_context(|| format!("create batch dir {}", batch.dir.display()))?;
        Ok(Self::empty(batch))
    }

    /// Store for a new batch under `runs_dir/<base_id>`, falling back to
    /// `<base_id>_2`, `<base_id>_3` and so on while the name is taken.
    pub fn create_unique(runs_dir: &Path, base_id: &str) -> Result<Self> {
        fs::create_dir_all(runs_dir)
            .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
        for attempt in 1..=MAX_BATCH_ATTEMPTS {
            let batch_id = if attempt == 1 {
                base_id.to_string()
            } else {
                format!("{base_id}_{attempt}")
            };
            let batch = BatchPaths::new(runs_dir, &batch_id);
            match fs::create_dir(&batch.dir) {
                Ok(()) => {
                    debug!(batch = %batch.dir.display(), attempt, "created batch dir");
                    return Ok(Self::empty(batch));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create batch dir {}", batch.dir.display()));
                }
            }
        }
        bail!(
            "no free batch dir for {base_id} under {} after {MAX_BATCH_ATTEMPTS} attempts",
            runs_dir.display()
        )
    }

    fn empty(batch: BatchPaths) -> Self {
        Self {
            batch,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Re-open a stored batch, loading every persisted `result.json`.
    pub fn open(batch_dir: &Path) -> Result<Self> {
        let batch = BatchPaths::from_dir(batch_dir);
        let mut records = BTreeMap::new();
        for entry in fs::read_dir(&batch.dir)
            .with_context(|| format!("read batch dir {}", batch.dir.display()))?
        {
            let entry = entry.context("read batch entry")?;
            let path = entry.path().join(RESULT_FILE);
            if !path.is_file() {
                continue;
            }
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let result: RunResult = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            if entry.file_name().to_str() != Some(result.run_id.as_str()) {
                warn!(path = %path.display(), run_id = %result.run_id, "result stored under a foreign directory, skipping");
                continue;
            }
            records.insert(result.run_id.clone(), result);
        }
        debug!(batch = %batch.dir.display(), count = records.len(), "opened result store");
        Ok(Self {
            batch,
            records: Mutex::new(records),
        })
    }

    pub fn batch(&self) -> &BatchPaths {
        &self.batch
    }

    /// Persist `result` once. The file write completes before the record becomes visible.
    pub fn record(&self, result: RunResult) -> Result<(), StoreError> {
        let mut records = self.lock();
        if records.contains_key(&result.run_id) {
            return Err(StoreError::DuplicateRun(result.run_id));
        }

        let paths = self.batch.run(&result.run_id);
        let run_id = result.run_id.clone();
        let persist = |source: io::Error| StoreError::Persist {
            run_id: run_id.clone(),
            source,
        };
        fs::create_dir_all(&paths.dir).map_err(persist)?;
        let mut body = serde_json::to_string_pretty(&result)
            .map_err(|err| persist(io::Error::other(err)))?;
        body.push('\n');

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.result)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::DuplicateRun(result.run_id));
            }
            Err(err) => return Err(persist(err)),
        };
        file.write_all(body.as_bytes()).map_err(persist)?;
        file.sync_all().map_err(persist)?;

        debug!(run_id = %result.run_id, status = %result.status(), "result recorded");
        records.insert(result.run_id.clone(), result);
        Ok(())
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunResult> {
        self.lock().get(run_id).cloned()
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All records so far, ordered by run identifier.
    pub fn snapshot(&self) -> Vec<RunResult> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, RunResult>> {
        // Records are only inserted after a complete write, so a poisoned map is still consistent.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
