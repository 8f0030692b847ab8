//! Root filesystem, mount and device directives.

use std::path::Path;

use lxcompose_common::constants::{DEFAULT_ROOT_SIZE, DEFAULT_STORAGE_BACKEND, ROOTFS_DIR};
use lxcompose_common::types::{Device, DeviceKind, Mount, Storage};

use crate::directive::Translation;

/// Value of the auto-mount directive when enabled.
pub const AUTO_MOUNTS: &str = "proc:mixed sys:mixed cgroup:mixed";

/// Emits the root filesystem and mount directives.
///
/// An unset backend means the directory backend with auto-mount enabled
/// and a 10 GiB root, unless those are set explicitly.
pub fn emit(storage: &Storage, container_dir: &Path, out: &mut Translation) {
    let defaulted = storage.backend.is_none();
    let backend = storage
        .backend
        .as_deref()
        .unwrap_or(DEFAULT_STORAGE_BACKEND);
    let root_size = storage
        .root_size
        .as_deref()
        .or(defaulted.then_some(DEFAULT_ROOT_SIZE));
    let auto_mount = storage.auto_mount.or(defaulted.then_some(true));

    out.push(
        "lxc.rootfs.path",
        format!("{backend}:{}", container_dir.join(ROOTFS_DIR).display()),
    );
    if let Some(size) = root_size {
        out.push("lxc.rootfs.size", size);
    }
    out.push("lxc.rootfs.backend", backend);
    if let Some(pool) = storage.pool.as_deref() {
        out.push("lxc.rootfs.pool", pool);
    }
    match auto_mount {
        Some(true) => out.push("lxc.mount.auto", AUTO_MOUNTS),
        Some(false) => out.push("lxc.mount.auto", ""),
        None => {}
    }
    for mount in &storage.mounts {
        out.push("lxc.mount.entry", mount_entry(mount));
    }
}

/// Formats `source target type options 0 0`.
#[must_use]
pub fn mount_entry(mount: &Mount) -> String {
    let kind = if mount.kind.is_empty() {
        "none"
    } else {
        mount.kind.as_str()
    };
    let options = if mount.options.is_empty() {
        "defaults".to_string()
    } else {
        mount.options.join(",")
    };
    format!("{} {} {kind} {options} 0 0", mount.source, mount.target)
}

/// Emits one bind mount entry per passed-through device.
pub fn emit_devices(devices: &[Device], out: &mut Translation) {
    for device in devices {
        let options = if device.options.is_empty() {
            match device.kind {
                DeviceKind::UnixChar | DeviceKind::UnixBlock => "bind,optional,create=file".into(),
                DeviceKind::Disk => "bind,optional,create=dir".into(),
            }
        } else {
            device.options.join(",")
        };
        tracing::trace!(device = %device.name, "device passthrough");
        out.push(
            "lxc.mount.entry",
            format!("{} {} none {options} 0 0", device.source, device.destination),
        );
    }
}
