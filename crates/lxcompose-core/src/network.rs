//! Network interface directives.
//!
//! Interfaces are indexed by their position in the spec and the index is
//! embedded in every key, so `lxc.net.0.*` and `lxc.net.1.*` never collide.
//! An isolated interface short-circuits the whole section.

use std::path::Path;

use ipnet::IpNet;
use lxcompose_common::types::{Interface, InterfaceKind, Network};

use crate::directive::{AuxFile, Translation};

/// Directory, relative to the container, holding generated network hooks.
pub const HOOKS_DIR: &str = "hooks";

/// Backend type name of an interface kind.
#[must_use]
pub const fn backend_type(kind: InterfaceKind) -> &'static str {
    match kind {
        InterfaceKind::None => "none",
        InterfaceKind::VirtualPair | InterfaceKind::Bridge => "veth",
        InterfaceKind::MacVlan => "macvlan",
        InterfaceKind::Physical => "phys",
    }
}

/// Emits the network directives and any traffic-control hook scripts.
///
/// `container_dir` is used to build absolute paths for hook directives.
pub fn emit(network: &Network, container_dir: &Path, out: &mut Translation) {
    if is_isolated(network) {
        tracing::debug!("isolated interface requested, network link down");
        out.push("lxc.net.0.type", "empty");
        return;
    }
    for (index, iface) in network.interfaces.iter().enumerate() {
        emit_interface(index, iface, container_dir, out);
    }
}

fn emit_interface(index: usize, iface: &Interface, container_dir: &Path, out: &mut Translation) {
    let key = |suffix: &str| format!("lxc.net.{index}.{suffix}");

    out.push(key("type"), backend_type(iface.kind));
    if iface.kind == InterfaceKind::None {
        return;
    }

    let link = match iface.kind {
        InterfaceKind::MacVlan | InterfaceKind::Physical => iface.host_side_name.as_deref(),
        _ => iface.bridge_name.as_deref(),
    };
    if let Some(link) = link {
        out.push(key("link"), link);
    }
    out.push(key("name"), format!("eth{index}"));
    out.push(key("flags"), "up");
    if matches!(iface.kind, InterfaceKind::VirtualPair | InterfaceKind::Bridge)
        && let Some(pair) = iface.host_side_name.as_deref()
    {
        out.push(key("veth.pair"), pair);
    }

    if iface.dhcp {
        out.push(key("ipv4.method"), "dhcp");
        out.push(key("ipv6.method"), "dhcp");
    } else if let Some(net) = iface.static_ip.as_deref().and_then(|ip| ip.parse::<IpNet>().ok()) {
        let family = family_prefix(&net);
        out.push(key(&format!("{family}.address")), net);
        if let Some(gateway) = iface.gateway.as_deref() {
            out.push(key(&format!("{family}.gateway")), gateway);
        }
    }

    for dns in &iface.dns {
        out.push(key("dns"), dns);
    }
    if let Some(hostname) = iface.hostname.as_deref() {
        out.push(key("hostname"), hostname);
    }
    if let Some(mtu) = iface.mtu {
        out.push(key("mtu"), mtu);
    }
    if let Some(mac) = iface.mac_address.as_deref() {
        out.push(key("hwaddr"), mac.to_ascii_lowercase());
    }

    if let Some(rate) = iface.bandwidth_limit.as_deref() {
        let relative = Path::new(HOOKS_DIR).join(format!("net-up-{index}.sh"));
        out.push(key("script.up"), container_dir.join(&relative).display());
        out.add_file(relative, AuxFile::script(bandwidth_script(index, rate)));
    }
}

const fn family_prefix(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    }
}

/// Renders the hook that shapes egress on the host-side device.
///
/// The runtime invokes network up scripts with the host device as the
/// fifth argument.
fn bandwidth_script(index: usize, rate: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # interface {index}: egress limit {rate}\n\
         set -e\n\
         dev=\"${{5:-$LXC_NET_PEER}}\"\n\
         tc qdisc replace dev \"$dev\" root tbf rate {rate} burst 32kbit latency 400ms\n"
    )
}

/// Returns whether any interface requests isolation, which takes the
/// whole network down.
#[must_use]
pub fn is_isolated(network: &Network) -> bool {
    network.interfaces.iter().any(|i| i.isolated)
}

/// Returns the address of the first non-isolated interface with a
/// parseable static IP.
#[must_use]
pub fn primary_static_address(network: &Network) -> Option<IpNet> {
    network
        .interfaces
        .iter()
        .filter(|i| !i.isolated && i.kind != InterfaceKind::None)
        .find_map(|i| i.static_ip.as_deref()?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_one(iface: Interface) -> Translation {
        let mut out = Translation::default();
        emit(&Network::single(iface), Path::new("/data/containers/web"), &mut out);
        out
    }

    #[test]
    fn default_kind_is_virtual_pair() {
        let out = emit_one(Interface::default());
        assert_eq!(
            out.lines,
            vec![
                "lxc.net.0.type = veth",
                "lxc.net.0.name = eth0",
                "lxc.net.0.flags = up",
            ]
        );
    }

    #[test]
    fn static_block_is_ordered() {
        let out = emit_one(Interface {
            kind: InterfaceKind::Bridge,
            bridge_name: Some("lxcbr0".into()),
            host_side_name: Some("vethweb".into()),
            static_ip: Some("10.0.3.10/24".into()),
            gateway: Some("10.0.3.1".into()),
            dns: vec!["1.1.1.1".into(), "9.9.9.9".into()],
            hostname: Some("web".into()),
            mtu: Some(1400),
            mac_address: Some("00:16:3E:AA:BB:CC".into()),
            ..Interface::default()
        });
        assert_eq!(
            out.lines,
            vec![
                "lxc.net.0.type = veth",
                "lxc.net.0.link = lxcbr0",
                "lxc.net.0.name = eth0",
                "lxc.net.0.flags = up",
                "lxc.net.0.veth.pair = vethweb",
                "lxc.net.0.ipv4.address = 10.0.3.10/24",
                "lxc.net.0.ipv4.gateway = 10.0.3.1",
                "lxc.net.0.dns = 1.1.1.1",
                "lxc.net.0.dns = 9.9.9.9",
                "lxc.net.0.hostname = web",
                "lxc.net.0.mtu = 1400",
                "lxc.net.0.hwaddr = 00:16:3e:aa:bb:cc",
            ]
        );
    }

    #[test]
    fn dhcp_emits_both_families() {
        let out = emit_one(Interface {
            dhcp: true,
            ..Interface::default()
        });
        assert_eq!(out.values("lxc.net.0.ipv4.method"), vec!["dhcp"]);
        assert_eq!(out.values("lxc.net.0.ipv6.method"), vec!["dhcp"]);
        assert!(out.values("lxc.net.0.ipv4.address").is_empty());
    }

    #[test]
    fn ipv6_static_uses_ipv6_keys() {
        let out = emit_one(Interface {
            static_ip: Some("fd00::10/64".into()),
            gateway: Some("fd00::1".into()),
            ..Interface::default()
        });
        assert_eq!(out.values("lxc.net.0.ipv6.address"), vec!["fd00::10/64"]);
        assert_eq!(out.values("lxc.net.0.ipv6.gateway"), vec!["fd00::1"]);
    }

    #[test]
    fn isolated_interface_skips_everything_else() {
        let net = Network {
            interfaces: vec![
                Interface {
                    bridge_name: Some("lxcbr0".into()),
                    ..Interface::default()
                },
                Interface {
                    isolated: true,
                    ..Interface::default()
                },
            ],
        };
        let mut out = Translation::default();
        emit(&net, Path::new("/c"), &mut out);
        assert_eq!(out.lines, vec!["lxc.net.0.type = empty"]);
    }

    #[test]
    fn interfaces_are_indexed_by_position() {
        let net = Network {
            interfaces: vec![
                Interface::default(),
                Interface {
                    kind: InterfaceKind::MacVlan,
                    host_side_name: Some("enp3s0".into()),
                    ..Interface::default()
                },
            ],
        };
        let mut out = Translation::default();
        emit(&net, Path::new("/c"), &mut out);
        assert_eq!(out.values("lxc.net.1.type"), vec!["macvlan"]);
        assert_eq!(out.values("lxc.net.1.link"), vec!["enp3s0"]);
        assert_eq!(out.values("lxc.net.1.name"), vec!["eth1"]);
        assert!(out.lines.iter().filter(|l| l.starts_with("lxc.net.0.")).count() == 3);
    }

    #[test]
    fn bandwidth_limit_generates_hook() {
        let out = emit_one(Interface {
            bandwidth_limit: Some("10mbit".into()),
            ..Interface::default()
        });
        assert_eq!(
            out.values("lxc.net.0.script.up"),
            vec!["/data/containers/web/hooks/net-up-0.sh"]
        );
        let hook = &out.files[Path::new("hooks/net-up-0.sh")];
        assert_eq!(hook.mode, 0o755);
        let text = String::from_utf8(hook.contents.clone()).unwrap();
        assert!(text.starts_with("#!/bin/sh\n"));
        assert!(text.contains("tbf rate 10mbit"));
    }

    #[test]
    fn primary_address_skips_addressless_interfaces() {
        let net = Network {
            interfaces: vec![
                Interface {
                    dhcp: true,
                    ..Interface::default()
                },
                Interface {
                    static_ip: Some("10.0.3.7/24".into()),
                    ..Interface::default()
                },
            ],
        };
        assert_eq!(
            primary_static_address(&net).map(|n| n.addr().to_string()),
            Some("10.0.3.7".into())
        );
        assert!(primary_static_address(&Network::default()).is_none());
    }
}
