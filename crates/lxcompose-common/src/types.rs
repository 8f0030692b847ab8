//! Domain types used across the lxcompose workspace.
//!
//! [`ContainerSpec`] is the abstract, backend-independent description of a
//! container. [`ContainerRecord`] is what the state store persists for each
//! container, and [`Template`] is a reusable snapshot of a spec.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a container as tracked by this system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Container exists but no process is running.
    #[default]
    Stopped,
    /// Container init process is running.
    Running,
    /// Container processes are frozen in their cgroup.
    Frozen,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Frozen => write!(f, "FROZEN"),
        }
    }
}

/// Full declarative description of a container.
///
/// Every field is optional in the serialized form; an empty spec is a
/// container with a single default rootfs and no overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Container name, also the state and artifact key.
    pub name: String,
    /// Image reference the rootfs was populated from.
    pub image: String,
    /// cgroup resource limits.
    pub resources: Resources,
    /// Network interfaces, in index order.
    pub network: Network,
    /// Host-to-guest port forwards.
    pub port_forwards: Vec<PortForward>,
    /// Root filesystem and mounts.
    pub storage: Storage,
    /// Confinement settings.
    pub security: Security,
    /// Environment passed to the init process.
    pub environment: BTreeMap<String, String>,
    /// Entrypoint argv prefix.
    pub entrypoint: Vec<String>,
    /// Arguments appended to the entrypoint.
    pub command: Vec<String>,
    /// Host devices exposed to the container.
    pub devices: Vec<Device>,
}

/// cgroup resource limits. `None` leaves the backend default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Relative CPU weight.
    pub cpu_shares: Option<u64>,
    /// CFS quota in microseconds per period.
    pub cpu_quota: Option<u64>,
    /// CFS period in microseconds.
    pub cpu_period: Option<u64>,
    /// Number of cores pinned, starting at core 0.
    pub core_count: Option<u32>,
    /// Memory limit in bytes.
    pub memory_limit: Option<u64>,
    /// Memory plus swap limit in bytes.
    pub memory_swap: Option<u64>,
}

/// Network configuration, always normalized to a list of interfaces.
///
/// Older documents carry a single interface object in place of the list;
/// those deserialize into a one-element list so nothing downstream has to
/// know about the legacy shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NetworkRepr")]
pub struct Network {
    /// Interfaces, indexed by position.
    pub interfaces: Vec<Interface>,
}

impl Network {
    /// Builds a network from a single legacy interface block.
    #[must_use]
    pub fn single(interface: Interface) -> Self {
        Self {
            interfaces: vec![interface],
        }
    }
}

/// An empty `{}` block, which configures no interface.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoInterfaces {}

#[derive(Deserialize)]
#[serde(untagged)]
enum NetworkRepr {
    List { interfaces: Vec<Interface> },
    Empty(NoInterfaces),
    Legacy(Interface),
}

impl From<NetworkRepr> for Network {
    fn from(repr: NetworkRepr) -> Self {
        match repr {
            NetworkRepr::List { interfaces } => Self { interfaces },
            NetworkRepr::Empty(NoInterfaces {}) => Self::default(),
            NetworkRepr::Legacy(interface) => Self::single(interface),
        }
    }
}

/// Kind of a network interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceKind {
    /// Share the host network namespace.
    None,
    /// Virtual ethernet pair, host side optionally attached to a bridge.
    #[default]
    VirtualPair,
    /// Virtual ethernet pair attached to a named bridge.
    Bridge,
    /// MAC-VLAN on a host device.
    MacVlan,
    /// Move a physical host device into the container.
    Physical,
}

/// A single network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    /// Interface kind.
    pub kind: InterfaceKind,
    /// Cut the container off the network (loopback only).
    pub isolated: bool,
    /// Bridge the host side is attached to.
    pub bridge_name: Option<String>,
    /// Host-side device name (veth peer, or host device for mac-vlan/physical).
    pub host_side_name: Option<String>,
    /// Static address with prefix length, e.g. `10.0.3.10/24`.
    pub static_ip: Option<String>,
    /// Default gateway for the static address.
    pub gateway: Option<String>,
    /// DNS servers.
    pub dns: Vec<String>,
    /// Configure addresses via DHCP.
    pub dhcp: bool,
    /// Hostname announced on this interface.
    pub hostname: Option<String>,
    /// Link MTU.
    pub mtu: Option<u32>,
    /// Guest MAC address.
    pub mac_address: Option<String>,
    /// Egress rate limit in tc syntax, e.g. `10mbit`.
    pub bandwidth_limit: Option<String>,
}

/// Transport protocol of a port forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Forward of a host port to a guest port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForward {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub guest_port: u16,
}

/// Root filesystem and mount configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    /// Root filesystem size, e.g. `10G`.
    pub root_size: Option<String>,
    /// Storage backend (`dir`, `btrfs`, `zfs`, `lvm`, ...).
    pub backend: Option<String>,
    /// Backend pool or volume group.
    pub pool: Option<String>,
    /// Mount proc, sys and cgroup automatically.
    pub auto_mount: Option<bool>,
    /// Additional mounts.
    pub mounts: Vec<Mount>,
}

/// A filesystem mount entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    /// Mount source.
    pub source: String,
    /// Mount target.
    pub target: String,
    /// Filesystem type; empty means `none` (bind mounts).
    pub kind: String,
    /// Mount options; empty means `defaults`.
    pub options: Vec<String>,
}

/// Named bundle of security defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Runtime default confinement.
    #[default]
    Default,
    /// User-namespaced, no privileged operations.
    Strict,
    /// Unconfined; requires `privileged = true`.
    Privileged,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Strict => write!(f, "strict"),
            Self::Privileged => write!(f, "privileged"),
        }
    }
}

/// Confinement configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    /// Isolation bundle.
    pub isolation_level: IsolationLevel,
    /// Run unconfined with all capabilities.
    pub privileged: bool,
    /// `AppArmor` profile name.
    pub apparmor_profile: Option<String>,
    /// `SELinux` process context.
    pub selinux_context: Option<String>,
    /// Seccomp policy file.
    pub seccomp_profile: Option<String>,
    /// Capabilities to keep; all others are dropped when non-empty.
    pub capabilities: Vec<String>,
}

/// Kind of a passed-through device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Character device node.
    #[default]
    UnixChar,
    /// Block device node.
    UnixBlock,
    /// Host directory.
    Disk,
}

/// A host device exposed inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    /// Device name, used for diagnostics.
    pub name: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Bind options; empty selects a default per kind.
    pub options: Vec<String>,
}

/// Persisted state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container name.
    pub name: String,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
    /// Last transition into `Running`.
    pub last_started_at: Option<DateTime<Utc>>,
    /// Last transition from `Running` into `Stopped`.
    pub last_stopped_at: Option<DateTime<Utc>>,
    /// Last status set by this system.
    pub status: ContainerStatus,
    /// Last applied specification.
    pub spec: ContainerSpec,
}

/// Metadata of a persisted template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// When the template was captured.
    pub created_at: DateTime<Utc>,
    /// Container the template was captured from.
    pub source: String,
    /// Spec new containers are derived from.
    pub base_spec: ContainerSpec,
}
