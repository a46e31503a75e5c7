//! Abstraction over the machine being converged.
//!
//! The `Host` trait lets the applier and fact gathering work against the real
//! system or against an in-memory mock in tests.
//!
//! ```text
//!   Applier / gather_facts
//!            │
//!      ┌─────▼─────┐
//!      │   Host    │ (trait)
//!      └─────┬─────┘
//!      ┌─────┴──────┐
//!  ┌───▼────┐  ┌────▼────┐
//!  │RealHost│  │MockHost │
//!  │(Linux) │  │(testing)│
//!  └────────┘  └─────────┘
//! ```

mod mock;
mod real;
mod scenarios;

use std::io;
use std::path::Path;

use serde::Serialize;

pub use mock::MockHost;
pub use real::RealHost;

/// Ownership and permission bits of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Requested metadata change. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaUpdate {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl MetaUpdate {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.uid.is_none() && self.gid.is_none()
    }

    /// Returns `true` if `current` already satisfies every requested field.
    pub fn satisfied_by(&self, current: &FileMeta) -> bool {
        self.mode.is_none_or(|m| m == current.mode)
            && self.uid.is_none_or(|u| u == current.uid)
            && self.gid.is_none_or(|g| g == current.gid)
    }
}

/// Result of a shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exit(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description for error reports: exit code plus the last stderr line.
    pub fn describe_failure(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{status}: {}", line.trim()),
            None => status,
        }
    }
}

/// Operations the convergence engine needs from a machine.
///
/// Read operations take `&self`; anything that changes the machine takes
/// `&mut self` so the mock can record it without interior mutability.
pub trait Host: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists (file or directory).
    fn exists(&self, path: &Path) -> bool;

    /// Checks if a path exists and is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Returns ownership and permission bits.
    fn metadata(&self, path: &Path) -> io::Result<FileMeta>;

    /// Replaces a file's content. Implementations must not leave a partially
    /// written file behind.
    fn write_file(&mut self, path: &Path, content: &str) -> io::Result<()>;

    /// Creates a directory and any missing parents.
    fn create_dir(&mut self, path: &Path) -> io::Result<()>;

    /// Applies the requested ownership and permission changes.
    fn set_metadata(&mut self, path: &Path, update: &MetaUpdate) -> io::Result<()>;

    /// Runs a command through `sh -c`. A non-zero exit is not an `Err`.
    fn run(&mut self, command: &str) -> io::Result<CommandOutput>;

    /// Checks whether a package is installed.
    fn package_installed(&self, name: &str) -> io::Result<bool>;

    /// Installs a package with the system package manager.
    fn install_package(&mut self, name: &str) -> io::Result<CommandOutput>;

    /// Resolves a user name to a UID.
    fn resolve_user(&self, name: &str) -> Option<u32>;

    /// Resolves a group name to a GID.
    fn resolve_group(&self, name: &str) -> Option<u32>;
}
