//! Declares the PostgreSQL configuration catalog for one host.
//!
//! Input is the host facts and the operator overrides; output is a
//! [`Catalog`] that the [`Applier`](crate::catalog::Applier) converges.
//!
//! ```text
//!   HostFacts ─┐
//!              ├─▶ TuningPlan ─┬─ Legacy ─▶ template + sysctl + pgtune
//!   overrides ─┘               └─ Modern ─▶ postgresql.conf (+ RedHat extras)
//!                                              │
//!                                           restart
//! ```
//!
//! Every catalog starts with the base server package. The restart command is
//! always refresh-only, so it runs only when the configuration it subscribes
//! to changed in the same run.

mod legacy;
mod modern;

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogError, Resource, ResourceId};
use crate::config::ConfigSource;
use crate::facts::{FactOverrides, FactSources, FactsError, HostFacts, gather_facts};
use crate::host::Host;
use crate::layout::OsLayout;
use crate::template::{TemplateError, TemplateStore, TemplateVars};
use crate::tuning::{Strategy, TuningPlan};

/// Owner and group of the files PostgreSQL reads.
pub const POSTGRES_USER: &str = "postgres";

/// Error type for catalog declaration.
#[derive(Debug)]
pub enum ManifestError {
    Facts(FactsError),
    Template(TemplateError),
    Catalog(CatalogError),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Facts(e) => write!(f, "fact gathering failed: {}", e),
            ManifestError::Template(e) => write!(f, "{}", e),
            ManifestError::Catalog(e) => write!(f, "invalid catalog: {}", e),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Facts(e) => Some(e),
            ManifestError::Template(e) => Some(e),
            ManifestError::Catalog(e) => Some(e),
        }
    }
}

impl From<FactsError> for ManifestError {
    fn from(e: FactsError) -> Self {
        ManifestError::Facts(e)
    }
}

impl From<TemplateError> for ManifestError {
    fn from(e: TemplateError) -> Self {
        ManifestError::Template(e)
    }
}

impl From<CatalogError> for ManifestError {
    fn from(e: CatalogError) -> Self {
        ManifestError::Catalog(e)
    }
}

/// Facts, tuning decisions and the resulting catalog for one host.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub facts: HostFacts,
    pub layout: OsLayout,
    pub tuning: TuningPlan,
    pub catalog: Catalog,
}

impl Manifest {
    /// Gathers facts from `host` and declares its catalog.
    pub fn for_host<H: Host + ?Sized>(
        host: &H,
        sources: &FactSources,
        config: &dyn ConfigSource,
        overrides: &FactOverrides,
        store: &TemplateStore,
    ) -> Result<Self, ManifestError> {
        let facts = gather_facts(host, sources, config, overrides)?;
        Self::build(host, facts, config, store)
    }

    /// Declares the catalog for already gathered facts.
    ///
    /// `host` is only read, to resolve templates from the template directory.
    pub fn build<H: Host + ?Sized>(
        host: &H,
        facts: HostFacts,
        config: &dyn ConfigSource,
        store: &TemplateStore,
    ) -> Result<Self, ManifestError> {
        let tuning = TuningPlan::compute(&facts, config);
        let layout = OsLayout::for_family(facts.os_family, &facts.postgres_version);
        let vars = template_vars(&facts, &layout, &tuning);

        let mut catalog = Catalog::new();
        catalog.add(Resource::package(&facts.package_name))?;

        let ctx = Context {
            facts: &facts,
            layout: &layout,
            tuning: &tuning,
            vars: &vars,
            base_package: ResourceId::package(&facts.package_name),
        };
        match tuning.strategy {
            Strategy::Legacy => legacy::declare(&mut catalog, &ctx, host, store)?,
            Strategy::Modern => modern::declare(&mut catalog, &ctx, host, store)?,
        }

        // Surface dangling references and cycles now rather than at apply time.
        catalog.order()?;

        info!(
            strategy = ?tuning.strategy,
            os_family = %facts.os_family,
            postgres_version = %facts.postgres_version,
            resources = catalog.len(),
            "catalog declared"
        );

        Ok(Self {
            facts,
            layout,
            tuning,
            catalog,
        })
    }
}

/// Shared inputs of the two declaration paths.
struct Context<'a> {
    facts: &'a HostFacts,
    layout: &'a OsLayout,
    tuning: &'a TuningPlan,
    vars: &'a TemplateVars,
    base_package: ResourceId,
}

/// Variables exposed to configuration templates.
///
/// Overrides are present only when set, so templates can guard them with
/// `{{#name}}` sections and fall back to their own defaults.
pub fn template_vars(facts: &HostFacts, layout: &OsLayout, tuning: &TuningPlan) -> TemplateVars {
    let mut vars = TemplateVars::new();
    let mut set = |k: &str, v: String| {
        vars.insert(k.to_string(), v);
    };

    set("postgres_version", facts.postgres_version.clone());
    set("total_memory_mb", facts.total_memory_mb.to_string());
    set("config_dir", layout.config_dir.display().to_string());
    set("data_directory", layout.data_dir.display().to_string());
    set("locale", layout.default_locale.to_string());

    let d = &tuning.derived;
    set("work_mem_mb", d.work_mem_mb.to_string());
    set("shared_buffers_mb", d.shared_buffers_mb.to_string());
    set("effective_cache_size_mb", d.effective_cache_size_mb.to_string());
    set("maintenance_work_mem_mb", d.maintenance_work_mem_mb.to_string());

    for (name, value) in tuning.overrides.entries() {
        if let Some(value) = value {
            set(name, value.to_string());
        }
    }

    debug!(count = vars.len(), "template variables");
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Applier, Outcome, ResourceKind};
    use crate::config::IniConfig;
    use crate::host::MetaUpdate;
    use crate::host::MockHost;
    use crate::layout::OsFamily;
    use std::path::Path;

    pub(super) fn manifest_for(host: &MockHost, config: &IniConfig) -> Manifest {
        Manifest::for_host(
            host,
            &FactSources::default(),
            config,
            &FactOverrides::default(),
            &TemplateStore::builtin(),
        )
        .unwrap()
    }

    pub(super) fn file_content<'a>(catalog: &'a Catalog, path: &str) -> &'a str {
        match &catalog.get(&ResourceId::file(path)).unwrap().kind {
            ResourceKind::File { content, .. } => content,
            other => panic!("not a file: {other:?}"),
        }
    }

    #[test]
    fn test_template_vars() {
        let facts = HostFacts::new(OsFamily::Debian, 4096 * 1024 * 1024, "jammy", "14");
        let mut config = IniConfig::new();
        config.set("postgresql", "random_page_cost", "1.1");
        let tuning = TuningPlan::compute(&facts, &config);
        let layout = OsLayout::for_family(facts.os_family, &facts.postgres_version);

        let vars = template_vars(&facts, &layout, &tuning);
        assert_eq!(vars["work_mem_mb"], "8");
        assert_eq!(vars["shared_buffers_mb"], "512");
        assert_eq!(vars["effective_cache_size_mb"], "1280");
        assert_eq!(vars["maintenance_work_mem_mb"], "128");
        assert_eq!(vars["random_page_cost"], "1.1");
        assert_eq!(vars["locale"], "C.UTF-8");
        assert_eq!(vars["config_dir"], "/etc/postgresql/14/main");
        assert!(!vars.contains_key("replication"));
    }

    #[test]
    fn test_catalog_starts_with_base_package() {
        for host in [
            MockHost::debian_host(),
            MockHost::trusty_host(),
        ] {
            let manifest = manifest_for(&host, &IniConfig::new());
            let first = &manifest.catalog.resources()[0];
            assert_eq!(first.id, ResourceId::package(&manifest.facts.package_name));
        }
    }

    #[test]
    fn test_rendering_is_idempotent() {
        let host = MockHost::debian_host();
        let config = IniConfig::parse("[postgresql]\nreplication = true\n").unwrap();
        let a = manifest_for(&host, &config);
        let b = manifest_for(&host, &config);
        let conf = "/etc/postgresql/14/main/postgresql.conf";
        assert_eq!(file_content(&a.catalog, conf), file_content(&b.catalog, conf));
        assert_eq!(a.catalog.resources(), b.catalog.resources());
    }

    #[test]
    fn test_second_apply_changes_nothing() {
        for mut host in [MockHost::debian_host(), MockHost::trusty_host()] {
            let manifest = manifest_for(&host, &IniConfig::new());

            let first = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
            assert!(first.is_success(), "{:?}", first.resources);
            assert!(first.summary.changed > 0);

            host.clear_log();
            let second = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
            assert_eq!(second.summary.changed, 0, "{:?}", second.resources);
            assert_eq!(second.summary.unchanged, manifest.catalog.len());
            assert!(host.commands().is_empty(), "{:?}", host.commands());
        }
    }

    #[test]
    fn test_package_install_alone_does_not_restart() {
        // Configuration already converged, server package missing.
        let facts = HostFacts::new(OsFamily::Debian, 8192 * 1024 * 1024, "jammy", "14");
        let template_host = MockHost::new();
        let manifest = Manifest::build(
            &template_host,
            facts,
            &IniConfig::new(),
            &TemplateStore::builtin(),
        )
        .unwrap();
        let conf = "/etc/postgresql/14/main/postgresql.conf";

        let mut host = MockHost::new();
        host.add_user(POSTGRES_USER, 113);
        host.add_group(POSTGRES_USER, 120);
        host.add_file(conf, file_content(&manifest.catalog, conf));
        host.set_metadata(
            Path::new(conf),
            &MetaUpdate {
                mode: Some(0o644),
                uid: Some(113),
                gid: Some(120),
            },
        )
        .unwrap();

        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert_eq!(
            report.outcome(&ResourceId::package("postgresql-14")),
            Some(&Outcome::Changed)
        );
        assert_eq!(
            report.outcome(&ResourceId::file(conf)),
            Some(&Outcome::Unchanged)
        );
        assert!(!host.ran("pg_ctlcluster 14 main restart"));
    }

    #[test]
    fn test_unrenderable_template_dir_is_error() {
        let mut host = MockHost::debian_host();
        host.add_file(
            "/srv/templates/14/postgresql.conf.tmpl",
            "port = {{port}}\n",
        );
        let err = Manifest::for_host(
            &host,
            &FactSources::default(),
            &IniConfig::new(),
            &FactOverrides::default(),
            &TemplateStore::new(Some("/srv/templates".into())),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Template(TemplateError::MissingVariable { .. })
        ));
    }

    #[test]
    fn test_facts_error_propagates() {
        let host = MockHost::new();
        let err = Manifest::for_host(
            &host,
            &FactSources::default(),
            &IniConfig::new(),
            &FactOverrides::default(),
            &TemplateStore::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Facts(FactsError::Read { .. })));
    }
}
