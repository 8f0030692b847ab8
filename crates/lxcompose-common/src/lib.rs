//! # lxcompose-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire lxcompose workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the container specification, the persisted
//! record shapes, and the error type every other crate returns.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
