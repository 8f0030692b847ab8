//! Persistent state management.
//!
//! Each container's [`ContainerRecord`] is stored as an independent JSON
//! document, `state/<name>.json`, and mirrored in an in-memory map guarded
//! by a single reader/writer lock. Saves are retried with exponential
//! backoff because persistence failures are treated as transient.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use lxcompose_common::config::RetryPolicy;
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{ContainerRecord, ContainerSpec, ContainerStatus};
use lxcompose_core::validate::validate_name;

use crate::cancel::CancelToken;
use crate::layout::{self, PRIVATE_FILE_MODE};
use crate::retry::retry;

/// Durable, concurrently accessible store of container records.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    retry: RetryPolicy,
    records: RwLock<HashMap<String, ContainerRecord>>,
}

impl StateStore {
    /// Opens the store in `dir`, creating it if needed, and loads every
    /// record found there.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let dir = dir.into();
        layout::create_private_dir(&dir).map_err(|e| LxError::Storage {
            path: dir.clone(),
            source: e,
        })?;
        let store = Self {
            dir,
            retry,
            records: RwLock::new(HashMap::new()),
        };
        let _ = store.load_all()?;
        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ContainerRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ContainerRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the record file for `name`.
    #[must_use]
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Replaces the in-memory map with the records on disk.
    ///
    /// Files that are not `.json` are ignored; files that fail to parse
    /// are skipped with a warning. Returns the number of records loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be listed.
    pub fn load_all(&self) -> Result<usize> {
        let mut records = self.write();
        let entries = fs::read_dir(&self.dir).map_err(|e| LxError::Storage {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    let _ = loaded.insert(record.name.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable state record");
                }
            }
        }
        tracing::debug!(dir = %self.dir.display(), count = loaded.len(), "state loaded");
        *records = loaded;
        Ok(records.len())
    }

    /// Persists `spec` and `status` for `name`.
    ///
    /// See [`StateStore::save_with`].
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or persistence keeps failing.
    pub fn save(
        &self,
        name: &str,
        spec: ContainerSpec,
        status: ContainerStatus,
    ) -> Result<ContainerRecord> {
        self.save_with(name, spec, status, &CancelToken::never())
    }

    /// Persists `spec` and `status` for `name`, retrying transient failures.
    ///
    /// `created_at` is preserved from an existing record. `last_started_at`
    /// is stamped when entering `Running` from any other status and
    /// `last_stopped_at` when entering `Stopped` from `Running`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable name,
    /// [`LxError::RetryExhausted`] if persistence keeps failing, or
    /// [`LxError::Cancelled`] if `cancel` fires.
    pub fn save_with(
        &self,
        name: &str,
        spec: ContainerSpec,
        status: ContainerStatus,
        cancel: &CancelToken,
    ) -> Result<ContainerRecord> {
        validate_name(name)?;
        retry(&self.retry, cancel, "save state", || {
            self.save_once(name, &spec, status)
        })
    }

    fn save_once(
        &self,
        name: &str,
        spec: &ContainerSpec,
        status: ContainerStatus,
    ) -> Result<ContainerRecord> {
        let mut records = self.write();
        let record = derive_record(records.get(name), name, spec.clone(), status, Utc::now());
        let path = self.record_path(name);
        let bytes = serde_json::to_vec_pretty(&record)?;
        layout::write_atomic(&path, &bytes, PRIVATE_FILE_MODE)
            .map_err(|e| LxError::Storage { path, source: e })?;
        let _ = records.insert(name.to_string(), record.clone());
        tracing::debug!(name, status = %status, "state saved");
        Ok(record)
    }

    /// Returns the record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<ContainerRecord> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| LxError::NotFound {
                kind: "container",
                id: name.to_string(),
            })
    }

    /// Returns whether a record exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Deletes the record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown name, or a storage
    /// error if the file cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut records = self.write();
        if !records.contains_key(name) {
            return Err(LxError::NotFound {
                kind: "container",
                id: name.to_string(),
            });
        }
        let path = self.record_path(name);
        layout::remove_path(&path).map_err(|e| LxError::Storage { path, source: e })?;
        let _ = records.remove(name);
        tracing::debug!(name, "state removed");
        Ok(())
    }

    /// Returns every record, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerRecord> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn read_record(path: &Path) -> Result<ContainerRecord> {
    let content = fs::read(path).map_err(|e| LxError::Storage {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// Builds the record that results from saving over `previous`.
fn derive_record(
    previous: Option<&ContainerRecord>,
    name: &str,
    spec: ContainerSpec,
    status: ContainerStatus,
    now: DateTime<Utc>,
) -> ContainerRecord {
    let previous_status = previous.map(|r| r.status);
    let mut last_started_at = previous.and_then(|r| r.last_started_at);
    let mut last_stopped_at = previous.and_then(|r| r.last_stopped_at);

    if status == ContainerStatus::Running && previous_status != Some(ContainerStatus::Running) {
        last_started_at = Some(now);
    }
    if status == ContainerStatus::Stopped && previous_status == Some(ContainerStatus::Running) {
        last_stopped_at = Some(now);
    }

    ContainerRecord {
        name: name.to_string(),
        created_at: previous.map_or(now, |r| r.created_at),
        last_started_at,
        last_stopped_at,
        status,
        spec,
    }
}
