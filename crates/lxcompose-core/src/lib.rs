//! # lxcompose-core
//!
//! Pure translation of abstract container specifications into the
//! backend's flat `key = value` configuration language.
//!
//! This crate covers:
//! - **Validation**: structural and cross-field checks on a spec.
//! - **Translation**: resources, network, port forwards, storage,
//!   security, environment and entrypoint into ordered directives.
//! - **Derived artifacts**: the init script, traffic-control hooks and
//!   firewall rule text the directives refer to.
//!
//! Nothing here touches the filesystem; writing the artifacts is the
//! runtime's job.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod capability;
pub mod directive;
pub mod firewall;
pub mod init;
pub mod network;
pub mod resources;
pub mod security;
pub mod storage;
pub mod translate;
pub mod validate;

pub use directive::{AuxFile, Translation};
pub use translate::translate;
