use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use super::TemplateError;
use crate::host::Host;

const BUILTIN_CONFIG: &str = include_str!("../../templates/postgresql.conf.tmpl");
const BUILTIN_LEGACY_CONFIG: &str = include_str!("../../templates/postgresql.conf.template.tmpl");

/// Which configuration template to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateKind {
    /// Final `postgresql.conf`, rendered with computed tuning.
    Config,
    /// `postgresql.conf.template`, the pgtune input.
    LegacyConfig,
}

impl TemplateKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            TemplateKind::Config => "postgresql.conf.tmpl",
            TemplateKind::LegacyConfig => "postgresql.conf.template.tmpl",
        }
    }

    /// Built-in template for `version`, if one fits.
    ///
    /// The modern template uses settings introduced in PostgreSQL 10+; the
    /// legacy one targets the 9.x series.
    fn builtin(&self, version: &str) -> Option<&'static str> {
        let major = version.split('.').next()?.parse::<u32>().ok()?;
        match self {
            TemplateKind::Config if major >= 10 => Some(BUILTIN_CONFIG),
            TemplateKind::LegacyConfig if major == 9 => Some(BUILTIN_LEGACY_CONFIG),
            _ => None,
        }
    }
}

/// Resolves templates by kind and PostgreSQL major version.
///
/// With a template directory configured, `<dir>/<version>/<file>` takes
/// precedence over the built-in templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    dir: Option<PathBuf>,
}

impl TemplateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn builtin() -> Self {
        Self::default()
    }

    /// Loads template source text.
    pub fn load<H: Host + ?Sized>(
        &self,
        host: &H,
        kind: TemplateKind,
        version: &str,
    ) -> Result<String, TemplateError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(version).join(kind.file_name());
            if host.exists(&path) {
                debug!(path = %path.display(), "using template from template directory");
                return host
                    .read_to_string(&path)
                    .map_err(|source| TemplateError::Read { path, source });
            }
        }

        kind.builtin(version)
            .map(str::to_string)
            .ok_or_else(|| TemplateError::NotFound {
                name: kind.file_name().to_string(),
                version: version.to_string(),
            })
    }
}
