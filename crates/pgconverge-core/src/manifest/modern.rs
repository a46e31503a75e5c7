//! Modern path: `postgresql.conf` is rendered directly with computed tuning.
//!
//! RedHat packages ship neither the snakeoil certificate nor the log and
//! `conf.d` directories the template refers to, so they are declared here.
//! The restart is ordered after them but only requires the server package.

use tracing::debug;

use super::{Context, ManifestError, POSTGRES_USER};
use crate::catalog::{Catalog, Resource, ResourceId};
use crate::host::Host;
use crate::layout::OsFamily;
use crate::template::{Template, TemplateKind, TemplateStore};

pub const SNAKEOIL_CERT: &str = "/etc/ssl/certs/ssl-cert-snakeoil.pem";
pub const SNAKEOIL_KEY: &str = "/etc/ssl/private/ssl-cert-snakeoil.key";
pub const SSL_PRIVATE_DIR: &str = "/etc/ssl/private";
pub const LOG_DIR: &str = "/var/log/postgresql";

const GENERATE_KEY: &str = "generate snakeoil key";
const GENERATE_CERT: &str = "generate snakeoil certificate";

pub(super) fn declare<H: Host + ?Sized>(
    catalog: &mut Catalog,
    ctx: &Context<'_>,
    host: &H,
    store: &TemplateStore,
) -> Result<(), ManifestError> {
    let source = store.load(host, TemplateKind::Config, &ctx.facts.postgres_version)?;
    let rendered = Template::parse(&source)?.render(ctx.vars)?;
    let config_id = ResourceId::file(&ctx.layout.config_file);

    catalog.add(
        Resource::file(&ctx.layout.config_file, rendered)
            .owner(POSTGRES_USER)
            .group(POSTGRES_USER)
            .mode(0o644)
            .require(ctx.base_package.clone()),
    )?;

    let mut restart = Resource::exec(ctx.layout.restart_command.clone())
        .refresh_only()
        .require(ctx.base_package.clone())
        .subscribe(config_id);

    match ctx.facts.os_family {
        OsFamily::RedHat => {
            for id in declare_redhat_extras(catalog, ctx)? {
                restart = restart.after(id);
            }
        }
        OsFamily::Debian => {}
    }

    catalog.add(restart)?;
    debug!(
        shared_buffers_mb = ctx.tuning.derived.shared_buffers_mb,
        effective_cache_size_mb = ctx.tuning.derived.effective_cache_size_mb,
        "declared rendered configuration"
    );
    Ok(())
}

/// Declares what Debian's packaging provides and RedHat's does not.
/// Returns the ids the restart is ordered after.
fn declare_redhat_extras(
    catalog: &mut Catalog,
    ctx: &Context<'_>,
) -> Result<Vec<ResourceId>, ManifestError> {
    let conf_d = Resource::directory(ctx.layout.config_dir.join("conf.d"))
        .owner(POSTGRES_USER)
        .group(POSTGRES_USER)
        .mode(0o700)
        .require(ctx.base_package.clone());
    let conf_d_id = conf_d.id.clone();
    catalog.add(conf_d)?;

    catalog.add(
        Resource::directory(SSL_PRIVATE_DIR)
            .owner("root")
            .group(POSTGRES_USER)
            .mode(0o710)
            .require(ctx.base_package.clone()),
    )?;

    catalog.add(
        Resource::named_exec(
            GENERATE_KEY,
            format!(
                "openssl genrsa -out {key} 2048 && chown root:{group} {key} && chmod 0640 {key}",
                key = SNAKEOIL_KEY,
                group = POSTGRES_USER
            ),
        )
        .unless(format!("test -f {}", SNAKEOIL_KEY))
        .require(ResourceId::directory(SSL_PRIVATE_DIR)),
    )?;

    let cert = Resource::named_exec(GENERATE_CERT, cert_command())
        .unless(format!("test -f {}", SNAKEOIL_CERT))
        .require(ResourceId::exec(GENERATE_KEY));
    let cert_id = cert.id.clone();
    catalog.add(cert)?;

    let log_dir = Resource::directory(LOG_DIR)
        .owner(POSTGRES_USER)
        .group(POSTGRES_USER)
        .mode(0o700)
        .require(ctx.base_package.clone());
    let log_dir_id = log_dir.id.clone();
    catalog.add(log_dir)?;

    Ok(vec![conf_d_id, cert_id, log_dir_id])
}

fn cert_command() -> String {
    format!(
        "openssl req -new -x509 -days 3650 -subj \"/CN=$(hostname -f)\" -key {} -out {}",
        SNAKEOIL_KEY, SNAKEOIL_CERT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Applier, Outcome, ResourceKind};
    use crate::config::IniConfig;
    use crate::host::{CommandOutput, FileMeta, MockHost};
    use crate::manifest::tests::{file_content, manifest_for};
    use crate::tuning::Strategy;
    use std::path::Path;

    const DEBIAN_CONF: &str = "/etc/postgresql/14/main/postgresql.conf";
    const REDHAT_CONF: &str = "/var/lib/pgsql/16/data/postgresql.conf";

    fn redhat_config() -> IniConfig {
        IniConfig::parse("[postgresql]\nversion = 16\n").unwrap()
    }

    #[test]
    fn test_debian_resources() {
        let manifest = manifest_for(&MockHost::debian_host(), &IniConfig::new());
        assert_eq!(manifest.tuning.strategy, Strategy::Modern);

        let ids: Vec<String> = manifest
            .catalog
            .order()
            .unwrap()
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "Package[postgresql-14]",
                "File[/etc/postgresql/14/main/postgresql.conf]",
                "Exec[pg_ctlcluster 14 main restart]",
            ]
        );

        let restart = manifest
            .catalog
            .get(&ResourceId::exec("pg_ctlcluster 14 main restart"))
            .unwrap();
        assert_eq!(restart.subscribe, vec![ResourceId::file(DEBIAN_CONF)]);
        assert!(matches!(
            restart.kind,
            ResourceKind::Exec {
                refresh_only: true,
                ..
            }
        ));
    }

    #[test]
    fn test_rendered_config_for_8gb() {
        let manifest = manifest_for(&MockHost::debian_host(), &IniConfig::new());
        let conf = file_content(&manifest.catalog, DEBIAN_CONF);
        assert!(conf.contains("shared_buffers = 1024MB\n"));
        assert!(conf.contains("work_mem = 16MB\n"));
        assert!(conf.contains("maintenance_work_mem = 256MB\n"));
        assert!(conf.contains("effective_cache_size = 2560MB\n"));
        assert!(conf.contains("data_directory = '/var/lib/postgresql/14/main'\n"));
        assert!(conf.contains("ssl_cert_file = '/etc/ssl/certs/ssl-cert-snakeoil.pem'\n"));
        assert!(!conf.contains("random_page_cost"));
        assert!(!conf.contains("listen_addresses"));
        assert!(!conf.contains("{{"));
    }

    #[test]
    fn test_overrides_rendered() {
        let config = IniConfig::parse(
            "[postgresql]\n\
             random_page_cost = 1.1\n\
             listen_addresses = *\n\
             ssl_cert_file = /etc/ssl/certs/db.pem\n\
             ssl_ca_file = /etc/ssl/certs/ca.pem\n",
        )
        .unwrap();
        let manifest = manifest_for(&MockHost::debian_host(), &config);
        let conf = file_content(&manifest.catalog, DEBIAN_CONF);
        assert!(conf.contains("random_page_cost = 1.1\n"));
        assert!(conf.contains("listen_addresses = '*'\n"));
        assert!(conf.contains("ssl_cert_file = '/etc/ssl/certs/db.pem'\n"));
        assert!(!conf.contains("ssl-cert-snakeoil.pem"));
        assert!(conf.contains("ssl_key_file = '/etc/ssl/private/ssl-cert-snakeoil.key'\n"));
        assert!(conf.contains("ssl_ca_file = '/etc/ssl/certs/ca.pem'\n"));
    }

    #[test]
    fn test_restart_only_when_config_changes() {
        let mut host = MockHost::debian_host();
        let manifest = manifest_for(&host, &IniConfig::new());

        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert_eq!(
            report.outcome(&ResourceId::file(DEBIAN_CONF)),
            Some(&Outcome::Changed)
        );
        assert!(host.ran("pg_ctlcluster 14 main restart"));
        let meta = host.metadata(Path::new(DEBIAN_CONF)).unwrap();
        assert_eq!(
            meta,
            FileMeta {
                mode: 0o644,
                uid: 113,
                gid: 120
            }
        );

        host.clear_log();
        let config = IniConfig::parse("[postgresql]\nrandom_page_cost = 1.1\n").unwrap();
        let manifest = manifest_for(&host, &config);
        Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert!(host.ran("pg_ctlcluster 14 main restart"));
    }

    #[test]
    fn test_redhat_resources() {
        let manifest = manifest_for(&MockHost::redhat_host(), &redhat_config());
        let catalog = &manifest.catalog;

        for id in [
            ResourceId::package("postgresql16-server"),
            ResourceId::file(REDHAT_CONF),
            ResourceId::directory("/var/lib/pgsql/16/data/conf.d"),
            ResourceId::directory(SSL_PRIVATE_DIR),
            ResourceId::exec(GENERATE_KEY),
            ResourceId::exec(GENERATE_CERT),
            ResourceId::directory(LOG_DIR),
            ResourceId::exec("systemctl restart postgresql-16"),
        ] {
            assert!(catalog.contains(&id), "missing {id}");
        }
        assert_eq!(catalog.len(), 8);

        let conf = file_content(catalog, REDHAT_CONF);
        assert!(conf.contains("lc_messages = 'en_US.UTF-8'\n"));
        assert!(conf.contains("data_directory = '/var/lib/pgsql/16/data'\n"));
        assert!(conf.contains("shared_buffers = 2048MB\n"));

        // The restart is ordered after every remediation step.
        let order: Vec<&ResourceId> = catalog.order().unwrap().iter().map(|r| &r.id).collect();
        assert_eq!(
            order.last(),
            Some(&&ResourceId::exec("systemctl restart postgresql-16"))
        );

        let restart = catalog
            .get(&ResourceId::exec("systemctl restart postgresql-16"))
            .unwrap();
        assert_eq!(
            restart.require,
            vec![ResourceId::package("postgresql16-server")]
        );
        assert_eq!(restart.subscribe, vec![ResourceId::file(REDHAT_CONF)]);
        assert_eq!(restart.after.len(), 3);
    }

    #[test]
    fn test_redhat_restart_survives_failed_certificate() {
        let mut host = MockHost::redhat_host();
        host.set_command_result(cert_command(), CommandOutput::exit(1));
        let manifest = manifest_for(&host, &redhat_config());

        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert!(!report.is_success());
        assert!(matches!(
            report.outcome(&ResourceId::exec(GENERATE_CERT)),
            Some(Outcome::Failed(_))
        ));
        assert_eq!(
            report.outcome(&ResourceId::file(REDHAT_CONF)),
            Some(&Outcome::Changed)
        );
        assert_eq!(
            report.outcome(&ResourceId::exec("systemctl restart postgresql-16")),
            Some(&Outcome::Changed)
        );
        assert!(host.ran("systemctl restart postgresql-16"));
    }

    #[test]
    fn test_redhat_snakeoil_skipped_when_present() {
        let mut host = MockHost::redhat_host();
        host.add_file(SNAKEOIL_KEY, "key");
        host.add_file(SNAKEOIL_CERT, "cert");
        let manifest = manifest_for(&host, &redhat_config());

        let report = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.outcome(&ResourceId::exec(GENERATE_KEY)),
            Some(&Outcome::Unchanged)
        );
        assert_eq!(
            report.outcome(&ResourceId::exec(GENERATE_CERT)),
            Some(&Outcome::Unchanged)
        );
        assert!(!host.commands().iter().any(|c| c.starts_with("openssl")));
    }

    #[test]
    fn test_redhat_converges() {
        let mut host = MockHost::redhat_host();
        let manifest = manifest_for(&host, &redhat_config());

        let first = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert!(first.is_success(), "{:?}", first.resources);
        assert!(host.commands().iter().any(|c| c.starts_with("openssl genrsa")));
        assert!(host.ran("systemctl restart postgresql-16"));
        let meta = host.metadata(Path::new(SSL_PRIVATE_DIR)).unwrap();
        assert_eq!((meta.mode, meta.uid, meta.gid), (0o710, 0, 120));

        // What openssl would have left behind.
        host.add_file(SNAKEOIL_KEY, "key");
        host.add_file(SNAKEOIL_CERT, "cert");
        host.clear_log();

        let second = Applier::new(&mut host).apply(&manifest.catalog).unwrap();
        assert_eq!(second.summary.changed, 0, "{:?}", second.resources);
        assert!(!host.ran("systemctl restart postgresql-16"));
    }
}
