//! pgconverge-core: declarative PostgreSQL configuration and tuning.
//!
//! Provides:
//! - `facts`: host facts from `/proc/meminfo`, `/etc/os-release` and config
//! - `config`: INI configuration source
//! - `layout`: per-OS-family paths and service commands
//! - `tuning`: memory-derived parameters, operator overrides, strategy
//! - `template`: logic-less configuration templates
//! - `manifest`: declares the resource catalog for a host
//! - `catalog`: resource graph and single-pass applier
//! - `host`: machine abstraction (real and mock)
//! - `fmt`: formatting helpers for CLI output

pub mod catalog;
pub mod config;
pub mod facts;
pub mod fmt;
pub mod host;
pub mod layout;
pub mod manifest;
pub mod template;
pub mod tuning;

/// Short git SHA this library was built from.
pub const BUILD: &str = env!("PGCONVERGE_BUILD");
