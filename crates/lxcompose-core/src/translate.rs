//! Specification to backend configuration translation.
//!
//! Sections are emitted in a fixed order: identity, security, resources,
//! network, port-forward hooks, storage, devices, environment, init.
//! Translation is deterministic: the same spec and container directory
//! always produce byte-identical output.

use std::path::Path;

use lxcompose_common::error::Result;
use lxcompose_common::types::ContainerSpec;

use crate::directive::Translation;
use crate::{firewall, init, network, resources, security, storage, validate};

/// Validates and translates a container specification.
///
/// `container_dir` is the directory the configuration will be written to;
/// directives that reference generated files use absolute paths under it.
///
/// # Errors
///
/// Returns a validation error if the spec is malformed or contradictory.
pub fn translate(spec: &ContainerSpec, container_dir: &Path) -> Result<Translation> {
    validate::validate_spec(spec)?;

    let mut out = Translation::default();
    out.push("lxc.uts.name", &spec.name);
    security::emit(&spec.security, &mut out);
    resources::emit(&spec.resources, &mut out);
    network::emit(&spec.network, container_dir, &mut out);
    firewall::emit(spec, &mut out)?;
    storage::emit(&spec.storage, container_dir, &mut out);
    storage::emit_devices(&spec.devices, &mut out);
    for (key, value) in &spec.environment {
        out.push("lxc.environment", format!("{key}={value}"));
    }
    init::emit(&spec.entrypoint, &spec.command, &mut out);

    tracing::debug!(
        name = %spec.name,
        directives = out.lines.len(),
        files = out.files.len(),
        "translated container spec"
    );
    Ok(out)
}
