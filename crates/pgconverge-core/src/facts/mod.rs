//! Host facts: the read-only description of the machine for one run.
//!
//! Facts come from three places, highest priority first: explicit overrides
//! (CLI), the config file, and detection from `/proc/meminfo` and
//! `/etc/os-release`.

pub mod parser;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::config::{ConfigSource, POSTGRESQL_SECTION};
use crate::host::Host;
use crate::layout::{OsFamily, UnknownOsFamily};
use parser::{ParseError, parse_mem_total, parse_os_release};

/// Facts about the host a catalog is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    pub os_family: OsFamily,
    /// Total physical memory in bytes.
    pub total_memory: u64,
    pub total_memory_mb: u64,
    /// PostgreSQL major version, e.g. `"16"` or `"9.3"`.
    pub postgres_version: String,
    /// Release codename (`jammy`) or version id when there is no codename.
    pub release_name: String,
    /// Name of the PostgreSQL server package.
    pub package_name: String,
}

impl HostFacts {
    /// Builds facts from a memory size in bytes, deriving the MB figure.
    pub fn new(
        os_family: OsFamily,
        total_memory: u64,
        release_name: impl Into<String>,
        postgres_version: impl Into<String>,
    ) -> Self {
        let postgres_version = postgres_version.into();
        Self {
            os_family,
            total_memory,
            total_memory_mb: total_memory / 1024 / 1024,
            package_name: os_family.default_package(&postgres_version),
            postgres_version,
            release_name: release_name.into(),
        }
    }
}

/// Where detected facts are read from.
#[derive(Debug, Clone)]
pub struct FactSources {
    pub proc_path: PathBuf,
    pub os_release: PathBuf,
}

impl Default for FactSources {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }
}

/// Facts forced by the operator instead of detected.
#[derive(Debug, Clone, Default)]
pub struct FactOverrides {
    pub os_family: Option<OsFamily>,
    pub release_name: Option<String>,
    pub memory_mb: Option<u64>,
    pub postgres_version: Option<String>,
}

/// Error type for fact gathering.
#[derive(Debug)]
pub enum FactsError {
    Read { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: ParseError },
    UnsupportedOsFamily(UnknownOsFamily),
    /// No configured version and no built-in default for the release.
    UnknownPostgresVersion { release: String },
    /// Memory override too large to express in bytes.
    MemoryOutOfRange { memory_mb: u64 },
}

impl fmt::Display for FactsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactsError::Read { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            FactsError::Parse { path, source } => write!(f, "{}: {}", path.display(), source),
            FactsError::UnsupportedOsFamily(e) => write!(f, "{}", e),
            FactsError::UnknownPostgresVersion { release } => write!(
                f,
                "no PostgreSQL version configured and no default for release '{}'; \
                 set [postgresql] version",
                release
            ),
            FactsError::MemoryOutOfRange { memory_mb } => {
                write!(f, "memory of {} MB is out of range", memory_mb)
            }
        }
    }
}

impl std::error::Error for FactsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FactsError::Read { source, .. } => Some(source),
            FactsError::Parse { source, .. } => Some(source),
            FactsError::UnsupportedOsFamily(e) => Some(e),
            FactsError::UnknownPostgresVersion { .. } | FactsError::MemoryOutOfRange { .. } => None,
        }
    }
}

/// PostgreSQL version shipped by a distribution release.
pub fn default_postgres_version(release: &str) -> Option<&'static str> {
    match release {
        "trusty" => Some("9.3"),
        "xenial" => Some("9.5"),
        "bionic" => Some("10"),
        "buster" => Some("11"),
        "focal" => Some("12"),
        "bullseye" => Some("13"),
        "jammy" => Some("14"),
        "bookworm" => Some("15"),
        "noble" => Some("16"),
        _ => None,
    }
}

fn read<H: Host + ?Sized>(host: &H, path: &Path) -> Result<String, FactsError> {
    host.read_to_string(path).map_err(|source| FactsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Gathers facts for this run.
pub fn gather_facts<H: Host + ?Sized>(
    host: &H,
    sources: &FactSources,
    config: &dyn ConfigSource,
    overrides: &FactOverrides,
) -> Result<HostFacts, FactsError> {
    let total_memory = match overrides.memory_mb {
        Some(mb) => mb
            .checked_mul(1024 * 1024)
            .ok_or(FactsError::MemoryOutOfRange { memory_mb: mb })?,
        None => {
            let path = sources.proc_path.join("meminfo");
            parse_mem_total(&read(host, &path)?)
                .map_err(|source| FactsError::Parse { path, source })?
        }
    };

    let (os_family, release_name) = match (overrides.os_family, &overrides.release_name) {
        (Some(family), Some(release)) => (family, release.clone()),
        (family, release) => {
            let path = &sources.os_release;
            let os_release = parse_os_release(&read(host, path)?).map_err(|source| {
                FactsError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            let family = match family {
                Some(f) => f,
                None => os_release
                    .ids()
                    .find_map(OsFamily::from_os_release_id)
                    .ok_or_else(|| {
                        FactsError::UnsupportedOsFamily(UnknownOsFamily(os_release.id.clone()))
                    })?,
            };
            let release = match release {
                Some(r) => r.clone(),
                None => os_release.release_name().unwrap_or_default(),
            };
            (family, release)
        }
    };

    let postgres_version = match overrides
        .postgres_version
        .clone()
        .or_else(|| config.get(POSTGRESQL_SECTION, "version"))
    {
        Some(v) => v,
        None => default_postgres_version(&release_name)
            .map(str::to_string)
            .ok_or_else(|| FactsError::UnknownPostgresVersion {
                release: release_name.clone(),
            })?,
    };

    let mut facts = HostFacts::new(os_family, total_memory, release_name, postgres_version);
    if let Some(package) = config.get(POSTGRESQL_SECTION, "package") {
        facts.package_name = package;
    }

    debug!(
        os_family = %facts.os_family,
        release = %facts.release_name,
        total_memory_mb = facts.total_memory_mb,
        postgres_version = %facts.postgres_version,
        "gathered host facts"
    );
    Ok(facts)
}
