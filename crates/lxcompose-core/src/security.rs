//! Confinement directives: isolation include, LSM profiles, capabilities.

use lxcompose_common::types::{IsolationLevel, Security};

use crate::capability;
use crate::directive::Translation;

/// Include file selected by an isolation level. Privileged containers
/// run unconfined and take none.
#[must_use]
pub const fn include_for(level: IsolationLevel) -> Option<&'static str> {
    match level {
        IsolationLevel::Default => Some("/usr/share/lxc/config/common.conf"),
        IsolationLevel::Strict => Some("/usr/share/lxc/config/userns.conf"),
        IsolationLevel::Privileged => None,
    }
}

/// Emits the security directives.
///
/// Privileged containers run unconfined and drop no capabilities; all
/// other settings are ignored for them. Capability names are assumed to
/// have passed validation; unknown names are skipped.
pub fn emit(security: &Security, out: &mut Translation) {
    if security.privileged {
        out.push("lxc.apparmor.profile", "unconfined");
        out.push("lxc.cap.drop", "");
        return;
    }

    if let Some(include) = include_for(security.isolation_level) {
        out.push("lxc.include", include);
    }

    if !security.capabilities.is_empty() {
        let keep: Vec<&str> = security
            .capabilities
            .iter()
            .filter_map(|c| capability::normalize(c))
            .fold(Vec::new(), |mut acc, cap| {
                if !acc.contains(&cap) {
                    acc.push(cap);
                }
                acc
            });
        out.push("lxc.cap.drop", "all");
        out.push("lxc.cap.keep", keep.join(" "));
    }

    if let Some(profile) = non_empty(security.apparmor_profile.as_deref()) {
        out.push("lxc.apparmor.profile", profile);
    }
    if let Some(context) = non_empty(security.selinux_context.as_deref()) {
        out.push("lxc.selinux.context", context);
    }
    if let Some(profile) = non_empty(security.seccomp_profile.as_deref()) {
        out.push("lxc.seccomp.profile", profile);
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
