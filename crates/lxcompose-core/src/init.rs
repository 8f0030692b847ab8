//! Generated init script for entrypoint/command overrides.

use std::path::Path;

use lxcompose_common::constants::ROOTFS_DIR;

use crate::directive::{AuxFile, Translation, shell_quote};

/// Directory, relative to the root filesystem, holding generated guest files.
pub const GUEST_DIR: &str = ".lxcompose";

/// Path of the init script as seen from inside the container.
pub const GUEST_INIT_PATH: &str = "/.lxcompose/init.sh";

/// Emits the init override when an entrypoint or command is set.
///
/// The script is placed inside the root filesystem so the backend can
/// execute it as the container's init. With neither set, nothing is
/// emitted and the backend default init applies.
pub fn emit(entrypoint: &[String], command: &[String], out: &mut Translation) {
    if entrypoint.is_empty() && command.is_empty() {
        return;
    }
    let argv: Vec<String> = entrypoint
        .iter()
        .chain(command)
        .map(|arg| shell_quote(arg))
        .collect();
    let script = format!("#!/bin/sh\nexec {}\n", argv.join(" "));

    let relative = Path::new(ROOTFS_DIR).join(GUEST_INIT_PATH.trim_start_matches('/'));
    out.add_file(relative, AuxFile::script(script));
    out.push("lxc.init.cmd", GUEST_INIT_PATH);
}
