//! Adapter for the external container runtime's command-line contract.
//!
//! The runtime exposes start, stop, freeze, unfreeze and info as separate
//! programs taking the container name. Failures are reported through the
//! exit code and text output, which [`refine`] maps back to error kinds.

use std::path::PathBuf;
use std::sync::Arc;

use lxcompose_common::config::Binaries;
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::ContainerStatus;

use crate::cancel::CancelToken;
use crate::command::{CommandOutput, CommandRunner};

/// Exit code reporting that the container is in the wrong state.
pub const EXIT_INVALID_STATE: i32 = 2;
/// Exit code reporting that the container does not exist.
pub const EXIT_NOT_FOUND: i32 = 3;

/// Operations understood by the external runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    /// Boot the container.
    Start,
    /// Shut the container down.
    Stop,
    /// Freeze all container processes.
    Freeze,
    /// Thaw a frozen container.
    Unfreeze,
    /// Report container status.
    Info,
}

impl RuntimeOp {
    /// Operation name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
            Self::Info => "info",
        }
    }
}

/// Drives the external runtime through a [`CommandRunner`].
pub struct LxcDriver {
    runner: Arc<dyn CommandRunner>,
    binaries: Binaries,
    lxc_path: PathBuf,
    logs_dir: PathBuf,
}

impl std::fmt::Debug for LxcDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LxcDriver")
            .field("binaries", &self.binaries)
            .field("lxc_path", &self.lxc_path)
            .finish_non_exhaustive()
    }
}

impl LxcDriver {
    /// Creates a driver for containers living under `lxc_path`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binaries: Binaries,
        lxc_path: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            binaries,
            lxc_path,
            logs_dir,
        }
    }

    fn program(&self, op: RuntimeOp) -> &str {
        match op {
            RuntimeOp::Start => &self.binaries.start,
            RuntimeOp::Stop => &self.binaries.stop,
            RuntimeOp::Freeze => &self.binaries.freeze,
            RuntimeOp::Unfreeze => &self.binaries.unfreeze,
            RuntimeOp::Info => &self.binaries.info,
        }
    }

    fn args(&self, op: RuntimeOp, name: &str) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            name.to_string(),
            "-P".to_string(),
            self.lxc_path.display().to_string(),
        ];
        if op == RuntimeOp::Start {
            args.push("-d".into());
            args.push("-o".into());
            args.push(self.logs_dir.join(format!("{name}.log")).display().to_string());
        }
        args
    }

    /// Runs `op` against `name`, failing on a non-zero exit status.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::Runtime`] carrying the captured output when the
    /// command fails, or the runner's error if it could not be run.
    pub fn invoke(&self, op: RuntimeOp, name: &str, cancel: &CancelToken) -> Result<CommandOutput> {
        let program = self.program(op);
        let output = self.runner.run(program, &self.args(op, name), cancel)?;
        if !output.success() {
            tracing::debug!(
                name,
                operation = op.as_str(),
                exit_code = output.exit_code,
                "runtime command failed"
            );
            return Err(LxError::Runtime {
                name: name.to_string(),
                operation: op.as_str(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }
        Ok(output)
    }

    /// Queries the runtime's own view of the container status.
    ///
    /// Returns `None` when the reported status is not one of the three
    /// known statuses.
    ///
    /// # Errors
    ///
    /// Returns an error if the info command fails.
    pub fn info(&self, name: &str, cancel: &CancelToken) -> Result<Option<ContainerStatus>> {
        let output = self.invoke(RuntimeOp::Info, name, cancel)?;
        Ok(parse_info_status(&output.stdout))
    }

    /// Returns whether the start program can be found on `PATH`.
    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.binaries.start).is_ok()
    }
}

/// Extracts the status from the info command's `State: <STATUS>` line.
///
/// Matching is case-insensitive. Transitional or unknown statuses
/// (`STARTING`, `FREEZING`, ...) yield `None`.
#[must_use]
pub fn parse_info_status(output: &str) -> Option<ContainerStatus> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("state") {
            return None;
        }
        match value.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => Some(ContainerStatus::Stopped),
            "RUNNING" => Some(ContainerStatus::Running),
            "FROZEN" => Some(ContainerStatus::Frozen),
            _ => None,
        }
    })
}

/// Maps a runtime failure onto the error kind its exit code or output
/// describes.
///
/// `requested` names the controller operation the caller asked for and
/// `status` is the status this system believed the container was in; both
/// are reported in [`LxError::InvalidState`] in place of the runtime
/// command. Errors other than [`LxError::Runtime`] pass through unchanged.
#[must_use]
pub fn refine(err: LxError, requested: &'static str, status: ContainerStatus) -> LxError {
    let LxError::Runtime {
        name,
        operation,
        exit_code,
        output,
    } = err
    else {
        return err;
    };
    let lower = output.to_ascii_lowercase();
    let invalid_state = exit_code == EXIT_INVALID_STATE
        || ["not running", "already running", "is frozen", "not frozen"]
            .iter()
            .any(|p| lower.contains(p));
    let not_found = exit_code == EXIT_NOT_FOUND
        || ["does not exist", "doesn't exist", "no such container"]
            .iter()
            .any(|p| lower.contains(p));

    if not_found {
        LxError::NotFound {
            kind: "container",
            id: name,
        }
    } else if invalid_state {
        LxError::InvalidState {
            name,
            operation: requested,
            status,
        }
    } else {
        LxError::Runtime {
            name,
            operation,
            exit_code,
            output,
        }
    }
}
