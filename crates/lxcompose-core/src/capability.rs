//! Linux capability names.
//!
//! Capabilities may be written with or without the conventional `CAP_`
//! prefix and in any case; they are emitted in the backend's lower-case,
//! prefix-free form.

/// Every capability known to the Linux kernel, in kernel numbering order.
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

/// Resolves a capability name to its canonical backend form.
///
/// Returns `None` if the name is not a known Linux capability.
#[must_use]
pub fn normalize(name: &str) -> Option<&'static str> {
    let lower = name.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix("cap_").unwrap_or(&lower);
    KNOWN_CAPABILITIES.iter().copied().find(|cap| *cap == bare)
}

/// Resolves a list of capabilities, dropping duplicates but keeping the
/// order in which they first appear.
///
/// Returns the first unknown name as the error value.
///
/// # Errors
///
/// Returns the offending name if any entry is not a known capability.
pub fn normalize_all<'a>(names: &'a [String]) -> Result<Vec<&'static str>, &'a str> {
    let mut keep: Vec<&'static str> = Vec::with_capacity(names.len());
    for name in names {
        let cap = normalize(name).ok_or(name.as_str())?;
        if !keep.contains(&cap) {
            keep.push(cap);
        }
    }
    Ok(keep)
}
