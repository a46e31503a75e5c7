//! Parsers for the system files host facts are gathered from.
//!
//! These are pure functions over file content so they can be tested with
//! string inputs.

use std::collections::HashMap;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parses `/proc/meminfo` content and returns `MemTotal` in bytes.
///
/// The kernel reports the value in kB (actually KiB).
pub fn parse_mem_total(content: &str) -> Result<u64, ParseError> {
    let line = content
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .ok_or_else(|| ParseError::new("MemTotal not found in meminfo"))?;

    let mut parts = line.split_whitespace().skip(1);
    let value: u64 = parts
        .next()
        .ok_or_else(|| ParseError::new("MemTotal has no value"))?
        .parse()
        .map_err(|_| ParseError::new(format!("invalid MemTotal line: {line}")))?;

    match parts.next() {
        Some("kB") | None => value
            .checked_mul(1024)
            .ok_or_else(|| ParseError::new(format!("MemTotal out of range: {value} kB"))),
        Some(unit) => Err(ParseError::new(format!("unexpected MemTotal unit '{unit}'"))),
    }
}

/// Fields of `/etc/os-release` relevant to family and release detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version: Option<String>,
    pub version_id: Option<String>,
    pub version_codename: Option<String>,
}

impl OsRelease {
    /// `ID` followed by the `ID_LIKE` tokens, in the order they should be tried.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.id_like.iter().map(String::as_str))
    }

    /// Release identity: the codename if the distribution has one, else the version.
    ///
    /// Ubuntu releases before 16.04 carry the codename only inside `VERSION`
    /// (`"14.04.6 LTS, Trusty Tahr"`).
    pub fn release_name(&self) -> Option<String> {
        if let Some(codename) = &self.version_codename {
            return Some(codename.clone());
        }
        if self.id == "ubuntu"
            && let Some((_, name)) = self.version.as_deref().and_then(|v| v.split_once(", "))
            && let Some(word) = name.split_whitespace().next()
        {
            return Some(word.to_ascii_lowercase());
        }
        self.version_id.clone()
    }
}

/// Parses `/etc/os-release` content.
///
/// Format is `KEY=value` per line, values optionally quoted.
pub fn parse_os_release(content: &str) -> Result<OsRelease, ParseError> {
    let mut fields: HashMap<&str, String> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), unquote(value.trim()));
        }
    }

    let id = fields
        .remove("ID")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::new("ID not found in os-release"))?;

    Ok(OsRelease {
        id,
        id_like: fields
            .remove("ID_LIKE")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        version: fields.remove("VERSION").filter(|s| !s.is_empty()),
        version_id: fields.remove("VERSION_ID").filter(|s| !s.is_empty()),
        version_codename: fields
            .remove("VERSION_CODENAME")
            .or_else(|| fields.remove("UBUNTU_CODENAME"))
            .filter(|s| !s.is_empty()),
    })
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Parses `/etc/passwd` or `/etc/group` content into a name -> id map.
///
/// Both formats keep the name in the first field and the numeric id in the
/// third: `name:password:id:...`.
pub fn parse_id_database(content: &str) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3
            && let Ok(id) = parts[2].parse::<u32>()
        {
            map.entry(parts[0].to_string()).or_insert(id);
        }
    }
    map
}
