//! External command invocation.
//!
//! The lifecycle controller and log retrieval never spawn processes
//! directly; they go through a [`CommandRunner`] injected at construction.
//! [`SystemRunner`] runs real programs, the `testing` module provides a
//! scripted stand-in.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use lxcompose_common::error::{LxError, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::cancel::CancelToken;

/// Interval at which a cancellable child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time a follow process gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code, `-1` if the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A failed run with the given exit code and error output.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Returns whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output and standard error joined for diagnostics.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Handle to a long-lived child process.
pub trait ProcessHandle: Send {
    /// Stops the process and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be signalled or reaped.
    fn terminate(&mut self) -> Result<()>;
}

/// A spawned process whose standard output is streamed.
pub struct SpawnedProcess {
    /// Standard output of the process.
    pub stdout: Box<dyn Read + Send>,
    /// Lifetime control of the process.
    pub handle: Box<dyn ProcessHandle>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").finish_non_exhaustive()
    }
}

/// Capability to run external programs.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion and captures its output.
    ///
    /// A non-zero exit status is not an error at this level.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::System`] if the program cannot be run and
    /// [`LxError::Cancelled`] if `cancel` fires first.
    fn run(&self, program: &str, args: &[String], cancel: &CancelToken) -> Result<CommandOutput>;

    /// Spawns `program` with its standard output piped to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::System`] if the program cannot be spawned.
    fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess>;
}

/// Runs real programs with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Creates a system runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn system_error(program: &str, source: std::io::Error) -> LxError {
    LxError::System {
        program: program.to_string(),
        source,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], cancel: &CancelToken) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "running command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| system_error(program, e))?;

        if !cancel.is_cancellable() {
            let output = child
                .wait_with_output()
                .map_err(|e| system_error(program, e))?;
            return Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: exit_code(output.status),
            });
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| system_error(program, e))? {
                break status;
            }
            if cancel.is_cancelled() {
                tracing::warn!(program, "cancelling in-flight command");
                let _ = child.kill();
                let _ = child.wait();
                return Err(LxError::Cancelled { operation: "command" });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned(),
            exit_code: exit_code(status),
        })
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<SpawnedProcess> {
        tracing::debug!(program, ?args, "spawning command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| system_error(program, e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            system_error(program, std::io::Error::other("standard output not captured"))
        })?;
        Ok(SpawnedProcess {
            stdout: Box::new(stdout),
            handle: Box::new(SystemChild {
                program: program.to_string(),
                child,
            }),
        })
    }
}

/// Reads a pipe to the end on a helper thread so the child never blocks
/// on a full pipe while it is being polled.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

struct SystemChild {
    program: String,
    child: Child,
}

impl ProcessHandle for SystemChild {
    fn terminate(&mut self) -> Result<()> {
        if self
            .child
            .try_wait()
            .map_err(|e| system_error(&self.program, e))?
            .is_some()
        {
            return Ok(());
        }

        if let Ok(raw) = i32::try_from(self.child.id())
            && kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
        {
            tracing::debug!(program = %self.program, pid = raw, "sent SIGTERM");
            let until = Instant::now() + TERMINATE_GRACE;
            while Instant::now() < until {
                if self
                    .child
                    .try_wait()
                    .map_err(|e| system_error(&self.program, e))?
                    .is_some()
                {
                    return Ok(());
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        let _ = self.child.kill();
        let _ = self
            .child
            .wait()
            .map_err(|e| system_error(&self.program, e))?;
        tracing::debug!(program = %self.program, "follow process killed");
        Ok(())
    }
}
