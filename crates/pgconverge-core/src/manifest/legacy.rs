//! Legacy path: `pgtune` writes the final configuration.
//!
//! The rendered template carries no memory settings. `pgtune` reads it and
//! writes `postgresql.conf` sized for half of physical memory, and the kernel
//! shared memory limits are raised to match.

use tracing::debug;

use super::{Context, ManifestError, POSTGRES_USER};
use crate::catalog::{Catalog, Resource, ResourceId};
use crate::host::Host;
use crate::template::{Template, TemplateKind, TemplateStore};
use crate::tuning::SharedMemory;

pub const PGTUNE_PACKAGE: &str = "pgtune";
pub const SYSCTL_FILE: &str = "/etc/sysctl.d/40-postgresql.conf";

/// Content of the sysctl drop-in.
pub fn sysctl_content(shm: &SharedMemory) -> String {
    format!(
        "# Managed by pgconverge.\n\
         kernel.shmall = {}\n\
         kernel.shmmax = {}\n\
         vm.dirty_ratio = 10\n\
         vm.dirty_background_ratio = 5\n",
        shm.half_memory_pages, shm.half_memory
    )
}

pub fn sysctl_command() -> String {
    format!("sysctl -p {}", SYSCTL_FILE)
}

pub(super) fn declare<H: Host + ?Sized>(
    catalog: &mut Catalog,
    ctx: &Context<'_>,
    host: &H,
    store: &TemplateStore,
) -> Result<(), ManifestError> {
    let shm = &ctx.tuning.shared_memory;
    let template_path = ctx.layout.template_file();
    let config_path = &ctx.layout.config_file;

    catalog.add(Resource::package(PGTUNE_PACKAGE))?;

    let source = store.load(host, TemplateKind::LegacyConfig, &ctx.facts.postgres_version)?;
    let rendered = Template::parse(&source)?.render(ctx.vars)?;
    catalog.add(
        Resource::file(&template_path, rendered)
            .owner(POSTGRES_USER)
            .group(POSTGRES_USER)
            .mode(0o644)
            .require(ctx.base_package.clone()),
    )?;

    catalog.add(Resource::file(SYSCTL_FILE, sysctl_content(shm)).mode(0o644))?;
    let sysctl = Resource::exec(sysctl_command())
        .refresh_only()
        .subscribe(ResourceId::file(SYSCTL_FILE));
    let sysctl_id = sysctl.id.clone();
    catalog.add(sysctl)?;

    let pgtune = Resource::exec(format!(
        "pgtune -T Web -M {} -i {} -o {}",
        shm.half_memory,
        template_path.display(),
        config_path.display()
    ))
    .refresh_only()
    .require(ResourceId::package(PGTUNE_PACKAGE))
    .subscribe(ResourceId::file(&template_path));
    let pgtune_id = pgtune.id.clone();
    catalog.add(pgtune)?;

    catalog.add(
        Resource::exec(ctx.layout.restart_command.clone())
            .refresh_only()
            .require(ctx.base_package.clone())
            .require(sysctl_id.clone())
            .subscribe(pgtune_id)
            .subscribe(sysctl_id),
    )?;

    debug!(
        half_memory = shm.half_memory,
        half_memory_pages = shm.half_memory_pages,
        "declared pgtune resources"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Applier, Outcome};
    use crate::config::IniConfig;
    use crate::host::MockHost;
    use crate::manifest::tests::{file_content, manifest_for};
    use crate::tuning::Strategy;

    const CONF: &str = "/etc/postgresql/9.3/main/postgresql.conf";
    const TEMPLATE: &str = "/etc/postgresql/9.3/main/postgresql.conf.template";
    const PGTUNE: &str = "pgtune -T Web -M 2147483648 \
        -i /etc/postgresql/9.3/main/postgresql.conf.template \
        -o /etc/postgresql/9.3/main/postgresql.conf";

    #[test]
    fn test_sysctl_for_4gb() {
        let content = sysctl_content(&SharedMemory::from_total(4 * 1024 * 1024 * 1024));
        assert!(content.contains("kernel.shmall = 524288\n"));
        assert!(content.contains("kernel.shmmax = 2147483648\n"));
        assert!(content.contains("vm.dirty_ratio = 10\n"));
        assert!(content.contains("vm.dirty_background_ratio = 5\n"));
    }

    #[test]
    fn test_legacy_resources() {
        let manifest = manifest_for(&MockHost::trusty_host(), &IniConfig::new());
        assert_eq!(manifest.tuning.strategy, Strategy::Legacy);

        let catalog = &manifest.catalog;
        for id in [
            ResourceId::package("postgresql-9.3"),
            ResourceId::package(PGTUNE_PACKAGE),
            ResourceId::file(TEMPLATE),
            ResourceId::file(SYSCTL_FILE),
            ResourceId::exec("sysctl -p /etc/sysctl.d/40-postgresql.conf"),
            ResourceId::exec(PGTUNE),
            ResourceId::exec("pg_ctlcluster 9.3 main restart"),
        ] {
            assert!(catalog.contains(&id), "missing {id}");
        }
        // pgtune owns the final file.
        assert!(!catalog.contains(&ResourceId::file(CONF)));

        let template = file_content(catalog, TEMPLATE);
        assert!(template.contains("PostgreSQL 9.3"));
        assert!(!template.contains("shared_buffers"));
        assert!(template.contains("lc_messages = 'C.UTF-8'"));
    }

    #[test]
    fn test_restart_runs_after_sysctl_and_pgtune() {
        let mut host = MockHost::trusty_host();
        let manifest = manifest_for(&host, &IniConfig::new());
        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert!(report.is_success());

        let position = |cmd: &str| host.commands().iter().position(|c| c == cmd).unwrap();
        let sysctl = position("sysctl -p /etc/sysctl.d/40-postgresql.conf");
        let pgtune = position(PGTUNE);
        let restart = position("pg_ctlcluster 9.3 main restart");
        assert!(restart > sysctl);
        assert!(restart > pgtune);
        assert_eq!(host.installs().to_vec(), vec![PGTUNE_PACKAGE.to_string()]);
    }

    #[test]
    fn test_template_change_alone_reruns_pgtune_and_restart() {
        let mut host = MockHost::trusty_host();
        let manifest = manifest_for(&host, &IniConfig::new());
        Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        host.clear_log();

        let config = IniConfig::parse("[postgresql]\nlisten_addresses = *\n").unwrap();
        let manifest = manifest_for(&host, &config);
        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();

        assert_eq!(
            report.outcome(&ResourceId::file(SYSCTL_FILE)),
            Some(&Outcome::Unchanged)
        );
        assert!(!host.ran("sysctl -p /etc/sysctl.d/40-postgresql.conf"));
        assert!(host.ran(PGTUNE));
        assert!(host.ran("pg_ctlcluster 9.3 main restart"));
    }

    #[test]
    fn test_failed_pgtune_skips_restart() {
        let mut host = MockHost::trusty_host();
        host.set_command_result(PGTUNE, crate::host::CommandOutput::exit(1));
        let manifest = manifest_for(&host, &IniConfig::new());
        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            report.outcome(&ResourceId::exec("pg_ctlcluster 9.3 main restart")),
            Some(Outcome::Skipped(_))
        ));
        // Unrelated branch still converged.
        assert!(host.ran("sysctl -p /etc/sysctl.d/40-postgresql.conf"));
    }
}
