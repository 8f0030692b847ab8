//! Port-forward firewall rules.
//!
//! Every forward produces one rule body that is installed by a pre-start
//! hook and retracted by a post-stop hook. Both hooks are rendered from
//! the same [`ForwardRule`], so the match criteria cannot drift apart.

use std::fmt;
use std::net::IpAddr;

use lxcompose_common::error::{LxError, Result};
use lxcompose_common::types::{ContainerSpec, PortForward, Protocol};

use crate::directive::{AuxFile, Translation};
use crate::network;

/// File, relative to the container, listing the generated rules.
pub const RULES_FILE: &str = "firewall.rules";

/// A DNAT rule forwarding a host port to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardRule {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Port matched on the host.
    pub host_port: u16,
    /// Destination port inside the container.
    pub guest_port: u16,
    /// Destination address of the container.
    pub destination: IpAddr,
}

impl ForwardRule {
    fn new(forward: &PortForward, destination: IpAddr) -> Self {
        Self {
            protocol: forward.protocol,
            host_port: forward.host_port,
            guest_port: forward.guest_port,
            destination,
        }
    }

    const fn tool(&self) -> &'static str {
        match self.destination {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    /// Command installing the rule.
    #[must_use]
    pub fn add_command(&self) -> String {
        format!("{} -t nat -A PREROUTING {self}", self.tool())
    }

    /// Command removing the rule.
    #[must_use]
    pub fn remove_command(&self) -> String {
        format!("{} -t nat -D PREROUTING {self}", self.tool())
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-p {} --dport {} -j DNAT --to-destination ",
            self.protocol, self.host_port
        )?;
        match self.destination {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.guest_port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.guest_port),
        }
    }
}

/// Builds the rules for every configured forward.
///
/// # Errors
///
/// Returns a validation error if forwards are configured but no interface
/// has a static address to forward to.
pub fn rules(spec: &ContainerSpec) -> Result<Vec<ForwardRule>> {
    if spec.port_forwards.is_empty() {
        return Ok(Vec::new());
    }
    if network::is_isolated(&spec.network) {
        return Err(LxError::validation(
            "port forwarding is not possible on an isolated network",
        ));
    }
    let destination = network::primary_static_address(&spec.network)
        .ok_or_else(|| {
            LxError::validation("port forwarding requires an interface with a static IP address")
        })?
        .addr();
    Ok(spec
        .port_forwards
        .iter()
        .map(|fwd| ForwardRule::new(fwd, destination))
        .collect())
}

/// Emits the paired hook directives and the rules file.
///
/// # Errors
///
/// Propagates the error from [`rules`].
pub fn emit(spec: &ContainerSpec, out: &mut Translation) -> Result<()> {
    let rules = rules(spec)?;
    if rules.is_empty() {
        return Ok(());
    }
    let mut text = String::new();
    for rule in &rules {
        let add = rule.add_command();
        let remove = rule.remove_command();
        out.push("lxc.hook.pre-start", &add);
        out.push("lxc.hook.post-stop", &remove);
        text.push_str(&format!("pre-start: {add}\npost-stop: {remove}\n"));
    }
    out.add_file(RULES_FILE, AuxFile::regular(text));
    Ok(())
}
