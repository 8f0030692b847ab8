//! Static validation of container specifications.
//!
//! Runs before translation and rejects malformed or contradictory specs
//! with a [`LxError::Validation`] naming the offending field.

use std::net::IpAddr;

use ipnet::IpNet;
use lxcompose_common::constants::{MAX_MTU, MAX_NAME_LENGTH, MIN_MTU};
use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{
    ContainerSpec, Interface, InterfaceKind, IsolationLevel, Security,
};

use crate::{capability, network};

/// Validates a container specification for semantic correctness.
///
/// # Checks performed
///
/// 1. The container name is usable as a file stem.
/// 2. Security flags are consistent and every capability is known.
/// 3. Every interface is well formed (bridge name, DHCP vs static address,
///    address/MAC syntax, MTU range).
/// 4. Port forwards use non-zero ports.
/// 5. Mounts, devices and environment entries are complete single-line values.
///
/// # Errors
///
/// Returns the first failed check as a validation error.
pub fn validate_spec(spec: &ContainerSpec) -> Result<()> {
    validate_name(&spec.name)?;
    validate_security(&spec.security)?;
    for (index, iface) in spec.network.interfaces.iter().enumerate() {
        validate_interface(index, iface)?;
    }
    check_port_forwards(spec)?;
    check_resources(spec)?;
    check_storage(spec)?;
    check_devices(spec)?;
    check_environment(spec)?;
    for arg in spec.entrypoint.iter().chain(&spec.command) {
        single_line("entrypoint/command", arg)?;
    }
    Ok(())
}

/// Validates a container or template name.
///
/// # Errors
///
/// Returns an error if the name is empty, too long, or contains characters
/// other than ASCII alphanumerics, `-`, `_` and `.`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LxError::validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(LxError::validation(format!(
            "name \"{name}\" exceeds {MAX_NAME_LENGTH} characters"
        )));
    }
    let mut chars = name.chars();
    let starts_alnum = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_alnum || !chars.all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
        return Err(LxError::validation(format!(
            "name \"{name}\" must start with a letter or digit and contain only letters, digits, '-', '_' or '.'"
        )));
    }
    Ok(())
}

/// Validates the security section.
///
/// # Errors
///
/// Returns an error if `strict` isolation is combined with privileged mode,
/// if `privileged` isolation lacks privileged mode, or if a capability
/// name is unknown.
pub fn validate_security(security: &Security) -> Result<()> {
    match security.isolation_level {
        IsolationLevel::Strict if security.privileged => {
            return Err(LxError::validation(
                "strict isolation cannot be combined with privileged mode",
            ));
        }
        IsolationLevel::Privileged if !security.privileged => {
            return Err(LxError::validation(
                "privileged isolation requires privileged mode",
            ));
        }
        _ => {}
    }
    if let Err(unknown) = capability::normalize_all(&security.capabilities) {
        return Err(LxError::validation(format!("unknown capability: {unknown}")));
    }
    for (field, value) in [
        ("apparmor_profile", &security.apparmor_profile),
        ("selinux_context", &security.selinux_context),
        ("seccomp_profile", &security.seccomp_profile),
    ] {
        if let Some(value) = value {
            single_line(field, value)?;
        }
    }
    Ok(())
}

/// Validates one network interface.
///
/// # Errors
///
/// Returns an error describing the first malformed field.
pub fn validate_interface(index: usize, iface: &Interface) -> Result<()> {
    let field = |name: &str| format!("network.interfaces[{index}].{name}");

    if iface.kind == InterfaceKind::Bridge
        && iface.bridge_name.as_deref().is_none_or(|b| b.trim().is_empty())
    {
        return Err(LxError::validation(format!(
            "{} is required for a bridge interface",
            field("bridge_name")
        )));
    }
    if iface.dhcp && iface.static_ip.is_some() {
        return Err(LxError::validation(format!(
            "{}: DHCP and a static address are mutually exclusive",
            field("dhcp")
        )));
    }
    let address = iface
        .static_ip
        .as_deref()
        .map(|ip| parse_cidr(&field("static_ip"), ip))
        .transpose()?;
    if let Some(gateway) = iface.gateway.as_deref() {
        let gw = parse_ip(&field("gateway"), gateway)?;
        if let Some(net) = address
            && net.addr().is_ipv4() != gw.is_ipv4()
        {
            return Err(LxError::validation(format!(
                "{}: gateway {gw} is not the same address family as {net}",
                field("gateway")
            )));
        }
    }
    for dns in &iface.dns {
        let _ = parse_ip(&field("dns"), dns)?;
    }
    if let Some(mtu) = iface.mtu
        && !(MIN_MTU..=MAX_MTU).contains(&mtu)
    {
        return Err(LxError::validation(format!(
            "{} {mtu} is outside {MIN_MTU}..={MAX_MTU}",
            field("mtu")
        )));
    }
    if let Some(mac) = iface.mac_address.as_deref()
        && !is_valid_mac(mac)
    {
        return Err(LxError::validation(format!(
            "{}: invalid MAC address \"{mac}\"",
            field("mac_address")
        )));
    }
    if let Some(rate) = iface.bandwidth_limit.as_deref()
        && !is_valid_rate(rate)
    {
        return Err(LxError::validation(format!(
            "{}: invalid rate \"{rate}\"",
            field("bandwidth_limit")
        )));
    }
    for (name, value) in [
        ("bridge_name", &iface.bridge_name),
        ("host_side_name", &iface.host_side_name),
        ("hostname", &iface.hostname),
    ] {
        if let Some(value) = value {
            single_line(&field(name), value)?;
            if value.contains(char::is_whitespace) {
                return Err(LxError::validation(format!(
                    "{} must not contain whitespace",
                    field(name)
                )));
            }
        }
    }
    Ok(())
}

/// Parses an address with prefix length.
///
/// # Errors
///
/// Returns a validation error naming `field` if the value is not a CIDR.
pub fn parse_cidr(field: &str, value: &str) -> Result<IpNet> {
    value
        .parse()
        .map_err(|_| LxError::validation(format!("{field}: invalid address/prefix \"{value}\"")))
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|_| LxError::validation(format!("{field}: invalid IP address \"{value}\"")))
}

/// Returns whether `mac` is six colon-separated hex octets.
#[must_use]
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Returns whether `rate` is a tc rate such as `10mbit` or `512kbps`.
fn is_valid_rate(rate: &str) -> bool {
    const UNITS: &[&str] = &[
        "bit", "kbit", "mbit", "gbit", "tbit", "bps", "kbps", "mbps", "gbps", "tbps",
    ];
    let digits = rate.chars().take_while(char::is_ascii_digit).count();
    let unit = &rate[digits..];
    digits > 0 && UNITS.contains(&unit.to_ascii_lowercase().as_str())
}

fn check_port_forwards(spec: &ContainerSpec) -> Result<()> {
    if !spec.port_forwards.is_empty() && network::is_isolated(&spec.network) {
        return Err(LxError::validation(
            "port_forwards: not possible on an isolated network",
        ));
    }
    for (index, fwd) in spec.port_forwards.iter().enumerate() {
        if fwd.host_port == 0 || fwd.guest_port == 0 {
            return Err(LxError::validation(format!(
                "port_forwards[{index}]: ports must be in 1..=65535"
            )));
        }
    }
    Ok(())
}

fn check_resources(spec: &ContainerSpec) -> Result<()> {
    let res = &spec.resources;
    if res.core_count == Some(0) {
        return Err(LxError::validation("resources.core_count must be at least 1"));
    }
    if res.cpu_period == Some(0) {
        return Err(LxError::validation("resources.cpu_period must be positive"));
    }
    if let (Some(limit), Some(swap)) = (res.memory_limit, res.memory_swap)
        && swap < limit
    {
        return Err(LxError::validation(
            "resources.memory_swap must not be below resources.memory_limit",
        ));
    }
    Ok(())
}

fn check_storage(spec: &ContainerSpec) -> Result<()> {
    let storage = &spec.storage;
    for (field, value) in [
        ("storage.root_size", &storage.root_size),
        ("storage.backend", &storage.backend),
        ("storage.pool", &storage.pool),
    ] {
        if let Some(value) = value {
            single_token(field, value)?;
        }
    }
    for (index, mount) in storage.mounts.iter().enumerate() {
        let field = format!("storage.mounts[{index}]");
        single_token(&format!("{field}.source"), &mount.source)?;
        single_token(&format!("{field}.target"), &mount.target)?;
        if !mount.kind.is_empty() {
            single_token(&format!("{field}.kind"), &mount.kind)?;
        }
        for option in &mount.options {
            single_token(&format!("{field}.options"), option)?;
        }
    }
    Ok(())
}

fn check_devices(spec: &ContainerSpec) -> Result<()> {
    for (index, device) in spec.devices.iter().enumerate() {
        let field = format!("devices[{index}]");
        single_token(&format!("{field}.source"), &device.source)?;
        single_token(&format!("{field}.destination"), &device.destination)?;
        for option in &device.options {
            single_token(&format!("{field}.options"), option)?;
        }
    }
    Ok(())
}

fn check_environment(spec: &ContainerSpec) -> Result<()> {
    for (key, value) in &spec.environment {
        if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
            return Err(LxError::validation(format!(
                "environment key \"{key}\" is invalid"
            )));
        }
        single_line(&format!("environment.{key}"), value)?;
    }
    Ok(())
}

/// Rejects values that would break out of a single directive line.
fn single_line(field: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(LxError::validation(format!(
            "{field} must not contain line breaks"
        )));
    }
    Ok(())
}

/// Rejects empty values and values that would split a mount entry.
fn single_token(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(LxError::validation(format!(
            "{field} must be a non-empty value without whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxcompose_common::types::{Mount, PortForward};

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            ..ContainerSpec::default()
        }
    }

    fn is_validation(result: Result<()>) -> bool {
        matches!(result, Err(LxError::Validation { .. }))
    }

    #[test]
    fn minimal_spec_is_valid() {
        assert!(validate_spec(&spec("web")).is_ok());
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("web-01.prod_a").is_ok());
        assert!(is_validation(validate_name("")));
        assert!(is_validation(validate_name("-web")));
        assert!(is_validation(validate_name("we/b")));
        assert!(is_validation(validate_name(&"a".repeat(65))));
    }

    #[test]
    fn strict_and_privileged_is_rejected() {
        let sec = Security {
            isolation_level: IsolationLevel::Strict,
            privileged: true,
            ..Security::default()
        };
        assert!(is_validation(validate_security(&sec)));
    }

    #[test]
    fn privileged_level_without_flag_is_rejected() {
        let sec = Security {
            isolation_level: IsolationLevel::Privileged,
            privileged: false,
            ..Security::default()
        };
        assert!(is_validation(validate_security(&sec)));
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let sec = Security {
            isolation_level: IsolationLevel::Strict,
            capabilities: vec!["NOT_A_CAP".into()],
            ..Security::default()
        };
        let err = validate_security(&sec).unwrap_err();
        assert!(err.to_string().contains("NOT_A_CAP"));
    }

    #[test]
    fn bridge_requires_name() {
        let iface = Interface {
            kind: InterfaceKind::Bridge,
            bridge_name: Some("  ".into()),
            ..Interface::default()
        };
        assert!(is_validation(validate_interface(0, &iface)));
    }

    #[test]
    fn dhcp_and_static_are_exclusive() {
        let iface = Interface {
            dhcp: true,
            static_ip: Some("10.0.3.5/24".into()),
            ..Interface::default()
        };
        assert!(is_validation(validate_interface(0, &iface)));
    }

    #[test]
    fn address_forms_are_checked() {
        let bad_cidr = Interface {
            static_ip: Some("10.0.3.500/24".into()),
            ..Interface::default()
        };
        assert!(is_validation(validate_interface(0, &bad_cidr)));

        let bad_mac = Interface {
            mac_address: Some("00:16:3e:zz:00:01".into()),
            ..Interface::default()
        };
        assert!(is_validation(validate_interface(0, &bad_mac)));

        let mixed_family = Interface {
            static_ip: Some("10.0.3.5/24".into()),
            gateway: Some("fd00::1".into()),
            ..Interface::default()
        };
        assert!(is_validation(validate_interface(0, &mixed_family)));

        let good = Interface {
            static_ip: Some("fd00::5/64".into()),
            gateway: Some("fd00::1".into()),
            dns: vec!["1.1.1.1".into()],
            mac_address: Some("00:16:3E:aa:00:01".into()),
            bandwidth_limit: Some("10mbit".into()),
            ..Interface::default()
        };
        assert!(validate_interface(0, &good).is_ok());
    }

    #[test]
    fn mtu_range_is_enforced() {
        for (mtu, ok) in [(67, false), (68, true), (1500, true), (65_535, true), (70_000, false)] {
            let iface = Interface {
                mtu: Some(mtu),
                ..Interface::default()
            };
            assert_eq!(validate_interface(0, &iface).is_ok(), ok, "mtu {mtu}");
        }
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut s = spec("web");
        s.port_forwards.push(PortForward {
            host_port: 0,
            guest_port: 80,
            ..PortForward::default()
        });
        assert!(is_validation(validate_spec(&s)));
    }

    #[test]
    fn forwards_into_isolated_network_are_rejected() {
        let mut s = spec("web");
        s.network.interfaces.push(Interface {
            static_ip: Some("10.0.3.10/24".into()),
            ..Interface::default()
        });
        s.network.interfaces.push(Interface {
            isolated: true,
            ..Interface::default()
        });
        s.port_forwards.push(PortForward {
            host_port: 8080,
            guest_port: 80,
            ..PortForward::default()
        });
        assert!(is_validation(validate_spec(&s)));

        let _ = s.network.interfaces.pop();
        assert!(validate_spec(&s).is_ok());
    }

    #[test]
    fn mount_fields_must_be_tokens() {
        let mut s = spec("web");
        s.storage.mounts.push(Mount {
            source: "/srv/data dir".into(),
            target: "/data".into(),
            ..Mount::default()
        });
        assert!(is_validation(validate_spec(&s)));
    }

    #[test]
    fn line_breaks_are_rejected() {
        let mut s = spec("web");
        let _ = s
            .environment
            .insert("GREETING".into(), "hi\nlxc.cap.drop =".into());
        assert!(is_validation(validate_spec(&s)));
    }
}
