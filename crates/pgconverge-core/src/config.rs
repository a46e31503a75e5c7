//! INI-style configuration source.
//!
//! Settings are looked up as `(section, key)` pairs and are either present or
//! absent; there are no typed defaults at this layer.
//!
//! ```text
//! [postgresql]
//! version = 16
//! listen_addresses = 10.0.0.5
//! random_page_cost = 1.1
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use ini::Ini;
use serde::Serialize;
use tracing::debug;

use crate::host::Host;

/// Section holding PostgreSQL settings and overrides.
pub const POSTGRESQL_SECTION: &str = "postgresql";

/// Key/value lookup keyed by section and key.
pub trait ConfigSource {
    /// Returns the value for `section`/`key`, or `None` when not configured.
    fn get(&self, section: &str, key: &str) -> Option<String>;
}

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read { path: PathBuf, source: io::Error },
    /// The content is not valid INI.
    Parse { line: usize, message: String },
    /// A key appears before any `[section]` header.
    KeyOutsideSection { key: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { line, message } => {
                write!(f, "config line {}: {}", line, message)
            }
            ConfigError::KeyOutsideSection { key } => {
                write!(f, "config key '{}' outside of any section", key)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { .. } | ConfigError::KeyOutsideSection { .. } => None,
        }
    }
}

/// Parsed INI file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IniConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses INI content.
    ///
    /// `#` and `;` start comment lines. Keys before any section header are an
    /// error. Empty values are treated as absent; when a key repeats, the last
    /// value wins.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Parse {
            line: e.line,
            message: e.msg.to_string(),
        })?;

        let mut config = Self::new();
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                if let Some((key, _)) = properties.iter().next() {
                    return Err(ConfigError::KeyOutsideSection {
                        key: key.to_string(),
                    });
                }
                continue;
            };
            let entries = config.sections.entry(section.to_string()).or_default();
            for (key, value) in properties.iter() {
                let value = value.trim();
                if value.is_empty() {
                    entries.remove(key);
                } else {
                    entries.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(config)
    }

    /// Loads a config file through `host`. A missing file yields an empty config.
    pub fn load<H: Host + ?Sized>(host: &H, path: &Path) -> Result<Self, ConfigError> {
        if !host.exists(path) {
            debug!(path = %path.display(), "config file not found, using empty config");
            return Ok(Self::new());
        }
        let content = host.read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Sets a value programmatically.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }
}

impl ConfigSource for IniConfig {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.sections.get(section)?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;

    #[test]
    fn test_parse_sections_and_keys() {
        let content = "\
# global comment
[machine]
deploy_type = postgresql

[postgresql]
version = 16
listen_addresses = 10.0.0.5, 127.0.0.1
; disabled
random_page_cost =
";
        let config = IniConfig::parse(content).unwrap();
        assert_eq!(config.get("machine", "deploy_type").as_deref(), Some("postgresql"));
        assert_eq!(config.get("postgresql", "version").as_deref(), Some("16"));
        assert_eq!(
            config.get("postgresql", "listen_addresses").as_deref(),
            Some("10.0.0.5, 127.0.0.1")
        );
        assert_eq!(config.get("postgresql", "random_page_cost"), None);
        assert_eq!(config.get("postgresql", "missing"), None);
        assert_eq!(config.get("nosuchsection", "version"), None);
    }

    #[test]
    fn test_later_values_win() {
        let config = IniConfig::parse("[a]\nk = 1\n[a]\nk = 2\n").unwrap();
        assert_eq!(config.get("a", "k").as_deref(), Some("2"));
    }

    #[test]
    fn test_repeated_key_last_wins_and_blank_clears() {
        let config = IniConfig::parse("[postgresql]\nport = 5432\nport = 5433\n").unwrap();
        assert_eq!(config.get("postgresql", "port").as_deref(), Some("5433"));

        let config = IniConfig::parse("[postgresql]\nport = 5432\nport =\n").unwrap();
        assert_eq!(config.get("postgresql", "port"), None);
    }

    #[test]
    fn test_parse_errors() {
        let err = IniConfig::parse("[postgresql]\nversion = 16\n[broken\n").unwrap_err();
        match err {
            ConfigError::Parse { line, ref message } => {
                assert!(line >= 2, "line {line}");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("config line "));

        let err = IniConfig::parse("version = 16\n[postgresql]\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::KeyOutsideSection { ref key } if key == "version"
        ));
        assert!(err.to_string().contains("outside of any section"));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let host = MockHost::new();
        let config = IniConfig::load(&host, Path::new("/etc/pgconverge/pgconverge.conf")).unwrap();
        assert_eq!(config, IniConfig::new());
    }

    #[test]
    fn test_load_from_host() {
        let mut host = MockHost::new();
        host.add_file("/etc/pgconverge/pgconverge.conf", "[postgresql]\nreplication = on\n");
        let config = IniConfig::load(&host, Path::new("/etc/pgconverge/pgconverge.conf")).unwrap();
        assert_eq!(config.get(POSTGRESQL_SECTION, "replication").as_deref(), Some("on"));
    }
}
