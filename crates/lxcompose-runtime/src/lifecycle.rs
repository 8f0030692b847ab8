//! Lifecycle controller driving containers through their state machine.
//!
//! Every operation reads the current record from the [`StateStore`],
//! validates the transition, invokes the external runtime and, only once
//! that succeeded, writes the new status back. Operations on the same
//! container name are serialized so that none of them writes back a record
//! read before another one saved.
//!
//! | Operation | Valid from              | Result           |
//! |-----------|-------------------------|------------------|
//! | create    | (absent)                | `Stopped`        |
//! | start     | `Stopped`               | `Running`        |
//! | stop      | `Running`, `Frozen`     | `Stopped`        |
//! | pause     | `Running`               | `Frozen`         |
//! | resume    | `Frozen`                | `Running`        |
//! | restart   | any                     | `Running`        |
//! | remove    | `Stopped`               | (deleted)        |
//! | update    | any                     | unchanged status |

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use lxcompose_common::config::RuntimeConfig;
use lxcompose_common::constants::{CONFIG_FILE, ROOTFS_DIR};
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{ContainerRecord, ContainerSpec, ContainerStatus};
use lxcompose_core::validate::validate_name;
use lxcompose_core::{Translation, firewall, init, network, translate};

use crate::cancel::CancelToken;
use crate::command::{CommandRunner, SystemRunner};
use crate::driver::{self, LxcDriver, RuntimeOp};
use crate::layout::{self, Layout};
use crate::state::StateStore;

/// Mode of the generated backend configuration file.
const CONFIG_MODE: u32 = 0o644;

/// Lifecycle operations subject to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Stopped to Running.
    Start,
    /// Running or Frozen to Stopped.
    Stop,
    /// Running to Frozen.
    Pause,
    /// Frozen to Running.
    Resume,
    /// Any status to Running.
    Restart,
    /// Stopped to deleted.
    Remove,
    /// Any status, spec replaced.
    Update,
}

impl Operation {
    /// Operation name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Restart => "restart",
            Self::Remove => "remove",
            Self::Update => "update",
        }
    }

    /// Returns whether the operation is legal from `status`.
    #[must_use]
    pub const fn allowed_from(self, status: ContainerStatus) -> bool {
        use ContainerStatus::{Frozen, Running, Stopped};
        match self {
            Self::Start | Self::Remove => matches!(status, Stopped),
            Self::Stop => matches!(status, Running | Frozen),
            Self::Pause => matches!(status, Running),
            Self::Resume => matches!(status, Frozen),
            Self::Restart | Self::Update => true,
        }
    }

    fn check(self, record: &ContainerRecord) -> Result<()> {
        if self.allowed_from(record.status) {
            Ok(())
        } else {
            Err(LxError::InvalidState {
                name: record.name.clone(),
                operation: self.as_str(),
                status: record.status,
            })
        }
    }
}

/// Owns the container state machine.
#[derive(Debug)]
pub struct LifecycleController {
    layout: Layout,
    store: Arc<StateStore>,
    driver: LxcDriver,
    /// One lock per container name, held from reading the record to saving it.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleController {
    /// Creates a controller, preparing the data directory and loading
    /// persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or state store cannot be
    /// opened.
    pub fn new(config: &RuntimeConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let layout = Layout::new(&config.data_dir);
        layout.ensure()?;
        let store = Arc::new(StateStore::open(layout.state_dir(), config.retry.clone())?);
        let driver = LxcDriver::new(
            runner,
            config.binaries.clone(),
            layout.containers_dir(),
            layout.logs_dir(),
        );
        tracing::info!(data_dir = %layout.root().display(), containers = store.list().len(), "lifecycle controller ready");
        Ok(Self {
            layout,
            store,
            driver,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a controller that runs the real runtime programs.
    ///
    /// # Errors
    ///
    /// See [`LifecycleController::new`].
    pub fn with_system_runner(config: &RuntimeConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemRunner::new()))
    }

    /// The state store backing this controller.
    #[must_use]
    pub const fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// The data directory layout.
    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns whether the runtime programs are installed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.driver.is_available()
    }

    /// Returns whether a container named `name` exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    /// Lists every container with its persisted status, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerRecord> {
        self.store.list()
    }

    /// Creates a container: materializes its configuration and records it
    /// as `Stopped`. The runtime is not invoked.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad spec, [`LxError::AlreadyExists`]
    /// for a taken name, or an I/O or storage error.
    pub fn create(&self, spec: ContainerSpec, cancel: &CancelToken) -> Result<ContainerRecord> {
        validate_name(&spec.name)?;
        let lock = self.name_lock(&spec.name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.store.contains(&spec.name) {
            return Err(LxError::AlreadyExists {
                kind: "container",
                id: spec.name,
            });
        }
        let dir = self.layout.container_dir(&spec.name);
        let translation = translate(&spec, &dir)?;
        let fresh = !dir.exists();

        let result = self
            .write_artifacts(&dir, &translation)
            .and_then(|()| {
                let rootfs = dir.join(ROOTFS_DIR);
                std::fs::create_dir_all(&rootfs).map_err(|e| LxError::Io {
                    path: rootfs,
                    source: e,
                })
            })
            .and_then(|()| {
                self.store
                    .save_with(&spec.name, spec.clone(), ContainerStatus::Stopped, cancel)
            });

        match result {
            Ok(record) => {
                tracing::info!(name = %record.name, "container created");
                Ok(record)
            }
            Err(e) => {
                if fresh {
                    let _ = layout::remove_path(&dir);
                }
                Err(e)
            }
        }
    }

    /// Returns the container record, with the status reconciled against
    /// the runtime's own report.
    ///
    /// A known runtime status overrides the persisted one in the returned
    /// value but is not written back. If the runtime cannot be queried or
    /// reports an unknown status, the persisted status is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown name, or
    /// [`LxError::Cancelled`] if `cancel` fires during the query.
    pub fn get(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        let mut record = self.store.get(name)?;
        match self.driver.info(name, cancel) {
            Ok(Some(status)) => {
                if status != record.status {
                    tracing::debug!(name, persisted = %record.status, runtime = %status, "runtime status differs from persisted");
                }
                record.status = status;
            }
            Ok(None) => {
                tracing::debug!(name, "runtime reported an unknown status, keeping persisted");
            }
            Err(e @ LxError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(name, error = %e, "runtime status query failed, keeping persisted");
            }
        }
        Ok(record)
    }

    /// Starts a stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::InvalidState`] unless the container is `Stopped`,
    /// or the runtime or storage error.
    pub fn start(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        self.transition(name, Operation::Start, RuntimeOp::Start, ContainerStatus::Running, cancel)
    }

    /// Stops a running or frozen container.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::InvalidState`] if the container is `Stopped`, or
    /// the runtime or storage error.
    pub fn stop(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        self.transition(name, Operation::Stop, RuntimeOp::Stop, ContainerStatus::Stopped, cancel)
    }

    /// Freezes a running container.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::InvalidState`] unless the container is `Running`,
    /// or the runtime or storage error.
    pub fn pause(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        self.transition(name, Operation::Pause, RuntimeOp::Freeze, ContainerStatus::Frozen, cancel)
    }

    /// Thaws a frozen container.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::InvalidState`] unless the container is `Frozen`,
    /// or the runtime or storage error.
    pub fn resume(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        self.transition(
            name,
            Operation::Resume,
            RuntimeOp::Unfreeze,
            ContainerStatus::Running,
            cancel,
        )
    }

    /// Stops the container if it is running or frozen, then starts it.
    ///
    /// Stops at the first failing step; the error names that step.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown name or
    /// [`LxError::Step`] wrapping the failure of the stop or start step.
    pub fn restart(&self, name: &str, cancel: &CancelToken) -> Result<ContainerRecord> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.get(name)?;
        Operation::Restart.check(&record)?;
        let step = |step: &'static str| {
            move |e: LxError| LxError::Step {
                operation: Operation::Restart.as_str(),
                step,
                source: Box::new(e),
            }
        };

        let mut spec = record.spec;
        if matches!(record.status, ContainerStatus::Running | ContainerStatus::Frozen) {
            let _ = self
                .driver
                .invoke(RuntimeOp::Stop, name, cancel)
                .map_err(|e| driver::refine(e, Operation::Restart.as_str(), record.status))
                .map_err(step("stop"))?;
            spec = self
                .store
                .save_with(name, spec, ContainerStatus::Stopped, cancel)
                .map_err(step("stop"))?
                .spec;
        }
        let _ = self
            .driver
            .invoke(RuntimeOp::Start, name, cancel)
            .map_err(|e| driver::refine(e, Operation::Restart.as_str(), ContainerStatus::Stopped))
            .map_err(step("start"))?;
        let saved = self
            .store
            .save_with(name, spec, ContainerStatus::Running, cancel)
            .map_err(step("start"))?;
        tracing::info!(name, from = %record.status, "container restarted");
        Ok(saved)
    }

    /// Replaces the container's spec and regenerates its configuration,
    /// keeping its status.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown name, a validation error
    /// for a bad spec, or an I/O or storage error.
    pub fn update(&self, spec: ContainerSpec, cancel: &CancelToken) -> Result<ContainerRecord> {
        let lock = self.name_lock(&spec.name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.get(&spec.name)?;
        Operation::Update.check(&record)?;
        let dir = self.layout.container_dir(&spec.name);
        let translation = translate(&spec, &dir)?;
        self.write_artifacts(&dir, &translation)?;
        let saved = self
            .store
            .save_with(&record.name, spec, record.status, cancel)?;
        tracing::info!(name = %saved.name, status = %saved.status, "container updated");
        Ok(saved)
    }

    /// Deletes a stopped container's configuration tree, log and record.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::InvalidState`] unless the container is `Stopped`,
    /// [`LxError::NotFound`] for an unknown name, or an I/O error.
    pub fn remove(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.get(name)?;
        Operation::Remove.check(&record)?;
        for path in [self.layout.container_dir(name), self.layout.log_path(name)] {
            layout::remove_path(&path).map_err(|e| LxError::Io { path, source: e })?;
        }
        self.store.remove(name)?;
        tracing::info!(name, "container removed");
        Ok(())
    }

    fn transition(
        &self,
        name: &str,
        operation: Operation,
        runtime_op: RuntimeOp,
        target: ContainerStatus,
        cancel: &CancelToken,
    ) -> Result<ContainerRecord> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.get(name)?;
        operation.check(&record)?;
        let from = record.status;
        let _ = self
            .driver
            .invoke(runtime_op, name, cancel)
            .map_err(|e| driver::refine(e, operation.as_str(), from))?;
        let saved = self.store.save_with(name, record.spec, target, cancel)?;
        tracing::info!(name, operation = operation.as_str(), from = %from, to = %target, "container transitioned");
        Ok(saved)
    }

    /// Returns the lock serializing operations on `name`. Not reentrant:
    /// callers holding it must not call another locking method.
    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Writes the backend configuration and generated files, replacing
    /// whatever a previous translation produced.
    fn write_artifacts(&self, dir: &Path, translation: &Translation) -> Result<()> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| LxError::Io { path, source: e }
        };
        layout::create_private_dir(dir).map_err(io(dir))?;

        let generated = [
            dir.join(network::HOOKS_DIR),
            dir.join(firewall::RULES_FILE),
            dir.join(ROOTFS_DIR).join(init::GUEST_DIR),
        ];
        for stale in &generated {
            layout::remove_path(stale).map_err(io(stale))?;
        }

        let config = dir.join(CONFIG_FILE);
        layout::write_atomic(&config, translation.render().as_bytes(), CONFIG_MODE)
            .map_err(io(&config))?;
        for (relative, file) in &translation.files {
            let path = dir.join(relative);
            layout::write_file(&path, &file.contents, file.mode).map_err(io(&path))?;
        }
        tracing::debug!(dir = %dir.display(), files = translation.files.len(), "configuration written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerStatus::{Frozen, Running, Stopped};

    #[test]
    fn transition_table() {
        let table = [
            (Operation::Start, [true, false, false]),
            (Operation::Stop, [false, true, true]),
            (Operation::Pause, [false, true, false]),
            (Operation::Resume, [false, false, true]),
            (Operation::Restart, [true, true, true]),
            (Operation::Remove, [true, false, false]),
            (Operation::Update, [true, true, true]),
        ];
        for (op, allowed) in table {
            for (status, ok) in [Stopped, Running, Frozen].into_iter().zip(allowed) {
                assert_eq!(op.allowed_from(status), ok, "{} from {status}", op.as_str());
            }
        }
    }
}
