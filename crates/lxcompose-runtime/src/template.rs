//! Reusable container templates.
//!
//! A template lives in `templates/<name>/`: `template.json` holds the
//! [`Template`] metadata and `files/` a copy of the source container's
//! configuration tree, root filesystem excluded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use lxcompose_common::constants::{CONFIG_FILE, ROOTFS_DIR, TEMPLATE_METADATA_FILE};
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{ContainerRecord, ContainerSpec, IsolationLevel, Template};
use lxcompose_core::validate::validate_name;
use lxcompose_core::{firewall, network};

use crate::cancel::CancelToken;
use crate::layout::{self, Layout, PRIVATE_FILE_MODE};
use crate::lifecycle::LifecycleController;

/// Subdirectory of a template holding the configuration snapshot.
pub const FILES_DIR: &str = "files";

/// Snapshot entries regenerated by every create; never copied back.
const GENERATED: [&str; 3] = [CONFIG_FILE, network::HOOKS_DIR, firewall::RULES_FILE];

/// Captures and instantiates templates.
#[derive(Debug)]
pub struct TemplateService {
    layout: Layout,
    controller: Arc<LifecycleController>,
}

impl TemplateService {
    /// Creates a template service creating containers through `controller`.
    #[must_use]
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self {
            layout: controller.layout().clone(),
            controller,
        }
    }

    /// Snapshots container `container` as template `template`.
    ///
    /// The snapshot is staged next to its final location and renamed into
    /// place, so a failed capture leaves no partial template behind.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown container,
    /// [`LxError::AlreadyExists`] for a taken template name, or an I/O error.
    pub fn create_template(
        &self,
        container: &str,
        template: &str,
        description: &str,
    ) -> Result<Template> {
        validate_name(template)?;
        let record = self.controller.store().get(container)?;
        let dir = self.layout.template_dir(template);
        if dir.exists() {
            return Err(LxError::AlreadyExists {
                kind: "template",
                id: template.to_string(),
            });
        }

        let staging = self.layout.templates_dir().join(format!(".{template}.partial"));
        let result = self
            .stage(&staging, &record, template, description)
            .and_then(|captured| {
                std::fs::rename(&staging, &dir)
                    .map(|()| captured)
                    .map_err(|e| LxError::Io {
                        path: dir.clone(),
                        source: e,
                    })
            });
        if result.is_err() {
            let _ = layout::remove_path(&staging);
        }
        let captured = result?;
        tracing::info!(template, source = container, "template created");
        Ok(captured)
    }

    fn stage(
        &self,
        staging: &Path,
        record: &ContainerRecord,
        template: &str,
        description: &str,
    ) -> Result<Template> {
        let io = |path: PathBuf| move |e: std::io::Error| LxError::Io { path, source: e };
        layout::remove_path(staging).map_err(io(staging.to_path_buf()))?;
        layout::create_private_dir(staging).map_err(io(staging.to_path_buf()))?;

        let source = self.layout.container_dir(&record.name);
        let files = layout::copy_tree(&source, &staging.join(FILES_DIR), &[ROOTFS_DIR], true)
            .map_err(io(source))?;

        let captured = Template {
            name: template.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            source: record.name.clone(),
            base_spec: record.spec.clone(),
        };
        let metadata = staging.join(TEMPLATE_METADATA_FILE);
        let bytes = serde_json::to_vec_pretty(&captured)?;
        layout::write_atomic(&metadata, &bytes, PRIVATE_FILE_MODE).map_err(io(metadata))?;
        tracing::debug!(template, files, "template staged");
        Ok(captured)
    }

    /// Creates container `name` from `template`, with `overrides` merged
    /// onto the captured spec (see [`merge_spec`]).
    ///
    /// Snapshot files that creation does not regenerate are copied into
    /// the new container directory. If that copy fails the new container
    /// is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown template,
    /// [`LxError::AlreadyExists`] for a taken container name, or any error
    /// from [`LifecycleController::create`].
    pub fn create_from_template(
        &self,
        template: &str,
        name: &str,
        overrides: &ContainerSpec,
        cancel: &CancelToken,
    ) -> Result<ContainerRecord> {
        let captured = self.get_template(template)?;
        validate_name(name)?;
        if self.controller.exists(name) {
            return Err(LxError::AlreadyExists {
                kind: "container",
                id: name.to_string(),
            });
        }
        let mut spec = merge_spec(&captured.base_spec, overrides);
        name.clone_into(&mut spec.name);
        let record = self.controller.create(spec, cancel)?;

        let files = self.layout.template_dir(template).join(FILES_DIR);
        if files.is_dir() {
            let dest = self.layout.container_dir(name);
            if let Err(e) = layout::copy_tree(&files, &dest, &GENERATED, false) {
                if let Err(cleanup) = self.controller.remove(name) {
                    tracing::warn!(name, error = %cleanup, "failed to remove partially created container");
                }
                return Err(LxError::Io {
                    path: files,
                    source: e,
                });
            }
        }
        tracing::info!(name, template, "container created from template");
        Ok(record)
    }

    /// Returns the metadata of `template`.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown template, or an error if
    /// its metadata cannot be read or parsed.
    pub fn get_template(&self, template: &str) -> Result<Template> {
        validate_name(template)?;
        let path = self.layout.template_dir(template).join(TEMPLATE_METADATA_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LxError::NotFound {
                    kind: "template",
                    id: template.to_string(),
                });
            }
            Err(e) => return Err(LxError::Io { path, source: e }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Lists all templates, sorted by name. Unreadable entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the templates directory cannot be listed.
    pub fn list_templates(&self) -> Result<Vec<Template>> {
        let dir = self.layout.templates_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LxError::Io { path: dir, source: e }),
        };
        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LxError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.get_template(&name) {
                Ok(t) => templates.push(t),
                Err(e) => tracing::warn!(template = %name, error = %e, "skipping unreadable template"),
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    /// Deletes `template`. Containers created from it are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`LxError::NotFound`] for an unknown template or an I/O
    /// error if it cannot be removed.
    pub fn delete_template(&self, template: &str) -> Result<()> {
        validate_name(template)?;
        let dir = self.layout.template_dir(template);
        if !dir.is_dir() {
            return Err(LxError::NotFound {
                kind: "template",
                id: template.to_string(),
            });
        }
        layout::remove_path(&dir).map_err(|e| LxError::Io { path: dir, source: e })?;
        tracing::info!(template, "template deleted");
        Ok(())
    }
}

fn replace_string(base: &mut String, over: &str) {
    if !over.is_empty() {
        over.clone_into(base);
    }
}

fn replace_option<T: Clone>(base: &mut Option<T>, over: Option<&T>) {
    if let Some(value) = over {
        *base = Some(value.clone());
    }
}

fn replace_vec<T: Clone>(base: &mut Vec<T>, over: &[T]) {
    if !over.is_empty() {
        *base = over.to_vec();
    }
}

/// Merges `overrides` onto `base`.
///
/// A set override field replaces the base value: non-empty strings and
/// lists, `Some` options, `true` flags and non-default isolation levels.
/// Unset fields leave the base untouched. Environment variables merge
/// key by key, overrides winning.
#[must_use]
pub fn merge_spec(base: &ContainerSpec, overrides: &ContainerSpec) -> ContainerSpec {
    let mut spec = base.clone();
    replace_string(&mut spec.name, &overrides.name);
    replace_string(&mut spec.image, &overrides.image);

    let (res, over) = (&mut spec.resources, &overrides.resources);
    replace_option(&mut res.cpu_shares, over.cpu_shares.as_ref());
    replace_option(&mut res.cpu_quota, over.cpu_quota.as_ref());
    replace_option(&mut res.cpu_period, over.cpu_period.as_ref());
    replace_option(&mut res.core_count, over.core_count.as_ref());
    replace_option(&mut res.memory_limit, over.memory_limit.as_ref());
    replace_option(&mut res.memory_swap, over.memory_swap.as_ref());

    replace_vec(&mut spec.network.interfaces, &overrides.network.interfaces);
    replace_vec(&mut spec.port_forwards, &overrides.port_forwards);

    let (storage, over) = (&mut spec.storage, &overrides.storage);
    replace_option(&mut storage.root_size, over.root_size.as_ref());
    replace_option(&mut storage.backend, over.backend.as_ref());
    replace_option(&mut storage.pool, over.pool.as_ref());
    replace_option(&mut storage.auto_mount, over.auto_mount.as_ref());
    replace_vec(&mut storage.mounts, &over.mounts);

    let (security, over) = (&mut spec.security, &overrides.security);
    if over.isolation_level != IsolationLevel::default() {
        security.isolation_level = over.isolation_level;
    }
    security.privileged |= over.privileged;
    replace_option(&mut security.apparmor_profile, over.apparmor_profile.as_ref());
    replace_option(&mut security.selinux_context, over.selinux_context.as_ref());
    replace_option(&mut security.seccomp_profile, over.seccomp_profile.as_ref());
    replace_vec(&mut security.capabilities, &over.capabilities);

    for (key, value) in &overrides.environment {
        let _ = spec.environment.insert(key.clone(), value.clone());
    }
    replace_vec(&mut spec.entrypoint, &overrides.entrypoint);
    replace_vec(&mut spec.command, &overrides.command);
    replace_vec(&mut spec.devices, &overrides.devices);
    spec
}
