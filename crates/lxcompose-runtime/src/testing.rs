//! Scripted [`CommandRunner`] for tests.
//!
//! Records every invocation and replays queued outputs per program.
//! Programs with nothing queued succeed with empty output.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lxcompose_common::error::Result;

use crate::cancel::CancelToken;
use crate::command::{CommandOutput, CommandRunner, ProcessHandle, SpawnedProcess};

/// A recorded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

/// In-memory command runner with scripted results.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<Invocation>>,
    queued: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    follow_output: Mutex<Vec<u8>>,
    spawned: AtomicUsize,
    terminated: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    /// Creates a runner where every program succeeds silently.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the output of the next run of `program`.
    pub fn push(&self, program: &str, output: CommandOutput) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    /// Sets the bytes every spawned process writes to standard output.
    pub fn set_follow_output(&self, bytes: impl Into<Vec<u8>>) {
        *self
            .follow_output
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = bytes.into();
    }

    /// Returns every recorded `run` invocation in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the programs run, in order.
    #[must_use]
    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    /// Number of processes spawned.
    #[must_use]
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Number of spawned processes terminated.
    #[must_use]
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String], _cancel: &CancelToken) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
            });
        let next = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(program)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_default())
    }

    fn spawn(&self, _program: &str, _args: &[String]) -> Result<SpawnedProcess> {
        let _ = self.spawned.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .follow_output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(SpawnedProcess {
            stdout: Box::new(Cursor::new(bytes)),
            handle: Box::new(ScriptedChild {
                terminated: Arc::clone(&self.terminated),
                done: false,
            }),
        })
    }
}

struct ScriptedChild {
    terminated: Arc<AtomicUsize>,
    done: bool,
}

impl ProcessHandle for ScriptedChild {
    fn terminate(&mut self) -> Result<()> {
        if !self.done {
            self.done = true;
            let _ = self.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
