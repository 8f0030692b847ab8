//! On-disk layout of the data directory and filesystem helpers.
//!
//! ```text
//! <data_dir>/
//!   containers/<name>/   backend config, generated hooks, rootfs/
//!   state/<name>.json    persisted ContainerRecord
//!   logs/<name>.log      append-only container log
//!   templates/<name>/    template.json + files/
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use lxcompose_common::constants::{
    CONFIG_FILE, CONTAINERS_DIR, LOGS_DIR, STATE_DIR, TEMPLATES_DIR,
};
use lxcompose_common::error::{LxError, Result};

/// Permission bits of directories owned by this system.
pub const DIR_MODE: u32 = 0o700;
/// Permission bits of persisted state and metadata files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Paths derived from the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Creates a layout rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    /// Creates every top-level directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.containers_dir(),
            self.state_dir(),
            self.logs_dir(),
            self.templates_dir(),
        ] {
            create_private_dir(&dir).map_err(|e| LxError::Io { path: dir, source: e })?;
        }
        Ok(())
    }

    /// The data directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent directory of every container tree.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    /// Configuration tree of one container.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.containers_dir().join(name)
    }

    /// Backend configuration file of one container.
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONFIG_FILE)
    }

    /// Directory of persisted records.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Directory of container logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Log file of one container.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.log"))
    }

    /// Directory of templates.
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.root.join(TEMPLATES_DIR)
    }

    /// Directory of one template.
    #[must_use]
    pub fn template_dir(&self, name: &str) -> PathBuf {
        self.templates_dir().join(name)
    }
}

/// Creates a directory (and parents) restricted to the owning user.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))
}

/// Writes `bytes` to `path` atomically with the given permission bits.
///
/// The data is written to a sibling temporary file, flushed to disk and
/// renamed over the destination, so readers never see a partial file.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Writes a file, creating parent directories, and applies `mode`.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write_file(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Removes a file or directory tree, ignoring a missing path.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound`.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Recursively copies `src` into `dst`.
///
/// Top-level entries named in `skip` are not copied. Existing files in
/// `dst` are replaced when `overwrite` is set and left alone otherwise.
/// Symlinks are recreated, not followed. Returns the number of files
/// copied.
///
/// # Errors
///
/// Returns the first I/O error encountered.
pub fn copy_tree(src: &Path, dst: &Path, skip: &[&str], overwrite: bool) -> std::io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == *s) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += copy_tree(&from, &to, &[], overwrite)?;
        } else if to.symlink_metadata().is_ok() && !overwrite {
            continue;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            remove_path(&to)?;
            std::os::unix::fs::symlink(target, &to)?;
            copied += 1;
        } else {
            let _ = fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}
