//! Backend directive accumulation and rendering.
//!
//! A translation produces an ordered list of `key = value` lines plus a
//! set of auxiliary files (hook scripts, the init script, firewall rule
//! text) that the directives point at.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

/// Mode of generated scripts.
pub const EXECUTABLE_MODE: u32 = 0o755;
/// Mode of generated non-executable files.
pub const REGULAR_MODE: u32 = 0o644;

/// A generated file written next to the backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFile {
    /// File contents.
    pub contents: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
}

impl AuxFile {
    /// Creates an executable script.
    #[must_use]
    pub fn script(contents: String) -> Self {
        Self {
            contents: contents.into_bytes(),
            mode: EXECUTABLE_MODE,
        }
    }

    /// Creates a regular, non-executable file.
    #[must_use]
    pub fn regular(contents: String) -> Self {
        Self {
            contents: contents.into_bytes(),
            mode: REGULAR_MODE,
        }
    }
}

/// Result of translating a container specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    /// Directive lines, in emission order.
    pub lines: Vec<String>,
    /// Auxiliary files keyed by path relative to the container directory.
    pub files: BTreeMap<PathBuf, AuxFile>,
}

impl Translation {
    /// Appends a `key = value` directive.
    pub fn push(&mut self, key: impl Display, value: impl Display) {
        let value = value.to_string();
        if value.is_empty() {
            self.lines.push(format!("{key} ="));
        } else {
            self.lines.push(format!("{key} = {value}"));
        }
    }

    /// Registers an auxiliary file.
    pub fn add_file(&mut self, relative: impl Into<PathBuf>, file: AuxFile) {
        let _ = self.files.insert(relative.into(), file);
    }

    /// Returns the values of every directive with the given key.
    #[must_use]
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| {
                let (k, v) = line.split_once('=')?;
                (k.trim_end() == key).then(|| v.trim_start())
            })
            .collect()
    }

    /// Renders the backend configuration file.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Quotes a string for POSIX `sh`.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
