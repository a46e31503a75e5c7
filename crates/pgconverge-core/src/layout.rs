//! Per-OS-family paths and commands for a PostgreSQL installation.
//!
//! Every value here is a pure function of the OS family and the PostgreSQL
//! major version. Adding a family means adding an `OsFamily` variant, and the
//! exhaustive matches below refuse to compile until it has a layout.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating system family as reported by `/etc/os-release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    RedHat,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Debian => "debian",
            OsFamily::RedHat => "redhat",
        }
    }

    /// Maps an os-release `ID` or `ID_LIKE` token to a family.
    pub fn from_os_release_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" => Some(OsFamily::Debian),
            "rhel" | "redhat" | "centos" | "fedora" | "rocky" | "almalinux" => {
                Some(OsFamily::RedHat)
            }
            _ => None,
        }
    }

    /// Default name of the PostgreSQL server package for this family.
    pub fn default_package(&self, postgres_version: &str) -> String {
        match self {
            OsFamily::Debian => format!("postgresql-{postgres_version}"),
            OsFamily::RedHat => format!("postgresql{postgres_version}-server"),
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an OS family string is not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOsFamily(pub String);

impl fmt::Display for UnknownOsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported OS family '{}' (expected debian or redhat)",
            self.0
        )
    }
}

impl std::error::Error for UnknownOsFamily {}

impl FromStr for OsFamily {
    type Err = UnknownOsFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debian" => Ok(OsFamily::Debian),
            "redhat" => Ok(OsFamily::RedHat),
            _ => Err(UnknownOsFamily(s.to_string())),
        }
    }
}

/// Resolved filesystem layout and service commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsLayout {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub restart_command: String,
    pub default_locale: &'static str,
    pub data_dir: PathBuf,
}

impl OsLayout {
    pub fn for_family(family: OsFamily, postgres_version: &str) -> Self {
        match family {
            OsFamily::Debian => {
                let config_dir = PathBuf::from(format!("/etc/postgresql/{postgres_version}/main"));
                Self {
                    config_file: config_dir.join("postgresql.conf"),
                    config_dir,
                    restart_command: format!("pg_ctlcluster {postgres_version} main restart"),
                    default_locale: "C.UTF-8",
                    data_dir: PathBuf::from(format!(
                        "/var/lib/postgresql/{postgres_version}/main"
                    )),
                }
            }
            OsFamily::RedHat => {
                let config_dir = PathBuf::from(format!("/var/lib/pgsql/{postgres_version}/data"));
                Self {
                    config_file: config_dir.join("postgresql.conf"),
                    data_dir: config_dir.clone(),
                    config_dir,
                    restart_command: format!("systemctl restart postgresql-{postgres_version}"),
                    default_locale: "en_US.UTF-8",
                }
            }
        }
    }

    /// Path of the intermediate template consumed by pgtune.
    pub fn template_file(&self) -> PathBuf {
        let mut name = self.config_file.clone().into_os_string();
        name.push(".template");
        PathBuf::from(name)
    }
}
