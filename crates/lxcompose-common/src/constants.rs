//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory when running as a system service.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/lxcompose";

/// Returns the data directory, preferring `$HOME/.lxcompose` when it can
/// be created, falling back to `/var/lib/lxcompose`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".lxcompose");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Directory holding one configuration tree per container.
pub const CONTAINERS_DIR: &str = "containers";
/// Directory holding one JSON state record per container.
pub const STATE_DIR: &str = "state";
/// Directory holding one log file per container.
pub const LOGS_DIR: &str = "logs";
/// Directory holding one snapshot per template.
pub const TEMPLATES_DIR: &str = "templates";

/// Name of the generated backend configuration file.
pub const CONFIG_FILE: &str = "config";
/// Name of the container root filesystem directory.
pub const ROOTFS_DIR: &str = "rootfs";
/// Name of the template metadata file.
pub const TEMPLATE_METADATA_FILE: &str = "template.json";

/// Maximum length of a container or template name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Default root filesystem size when no storage backend is configured.
pub const DEFAULT_ROOT_SIZE: &str = "10G";
/// Default storage backend.
pub const DEFAULT_STORAGE_BACKEND: &str = "dir";

/// Smallest MTU accepted on an interface.
pub const MIN_MTU: u32 = 68;
/// Largest MTU accepted on an interface.
pub const MAX_MTU: u32 = 65_535;
