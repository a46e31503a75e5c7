//! pgconverge - PostgreSQL configuration and tuning for a single host.
//!
//! Gathers host facts, derives memory-based tuning, declares the resulting
//! resources (server package, postgresql.conf, kernel limits, restart) and
//! converges the host to them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

use pgconverge_core::catalog::{Applier, Catalog, Outcome, Ownership, Report, ResourceKind};
use pgconverge_core::config::IniConfig;
use pgconverge_core::facts::{FactOverrides, FactSources, HostFacts, gather_facts};
use pgconverge_core::fmt::{format_bytes, format_mb, format_mode, truncate};
use pgconverge_core::host::RealHost;
use pgconverge_core::layout::OsFamily;
use pgconverge_core::manifest::Manifest;
use pgconverge_core::template::TemplateStore;
use pgconverge_core::tuning::{Strategy, TuningPlan};

/// Exit status of `apply` when at least one resource failed.
const EXIT_RESOURCE_FAILED: i32 = 2;

/// Declarative PostgreSQL configuration and tuning.
#[derive(Parser)]
#[command(
    name = "pgconverge",
    about = "Configure and tune PostgreSQL on this host",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file ([postgresql] section).
    #[arg(
        long,
        global = true,
        env = "PGCONVERGE_CONFIG",
        default_value = "/etc/pgconverge/pgconverge.conf"
    )]
    config: PathBuf,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, global = true, default_value = "/proc")]
    proc_path: PathBuf,

    /// Path to os-release file.
    #[arg(long, global = true, default_value = "/etc/os-release")]
    os_release: PathBuf,

    /// Directory with <version>/<template> files overriding the built-in templates.
    #[arg(long, global = true, value_name = "DIR")]
    template_dir: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Facts to use instead of detecting them, e.g. to plan for another host.
#[derive(Args)]
struct OverrideArgs {
    /// Total memory in MB.
    #[arg(long, global = true)]
    memory_mb: Option<u64>,

    /// OS family (debian or redhat).
    #[arg(long, global = true)]
    os_family: Option<OsFamily>,

    /// Release codename, e.g. jammy or trusty.
    #[arg(long, global = true)]
    release: Option<String>,

    /// PostgreSQL major version, e.g. 16 or 9.3.
    #[arg(long, global = true)]
    postgres_version: Option<String>,
}

impl From<OverrideArgs> for FactOverrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            os_family: args.os_family,
            release_name: args.release,
            memory_mb: args.memory_mb,
            postgres_version: args.postgres_version,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print gathered host facts.
    Facts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the tuning strategy and derived parameters.
    Tune {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the resources in evaluation order.
    Plan {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Converge the host.
    Apply {
        /// Report what would change without changing anything.
        #[arg(long)]
        noop: bool,
        /// Output the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pgconverge={}", level).parse()?)
        .add_directive(format!("pgconverge_core={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;
    debug!(
        "pgconverge {} ({})",
        env!("CARGO_PKG_VERSION"),
        pgconverge_core::BUILD
    );

    let host = RealHost::new();
    let config = IniConfig::load(&host, &cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let sources = FactSources {
        proc_path: cli.proc_path,
        os_release: cli.os_release,
    };
    let overrides = FactOverrides::from(cli.overrides);
    let store = TemplateStore::new(cli.template_dir);

    match cli.command {
        Command::Facts { json } => {
            let facts = gather_facts(&host, &sources, &config, &overrides)
                .context("gathering host facts")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&facts)?);
            } else {
                print_facts(&facts);
            }
        }
        Command::Tune { json } => {
            let facts = gather_facts(&host, &sources, &config, &overrides)
                .context("gathering host facts")?;
            let plan = TuningPlan::compute(&facts, &config);
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_tuning(&facts, &plan);
            }
        }
        Command::Plan { json } => {
            let manifest = Manifest::for_host(&host, &sources, &config, &overrides, &store)
                .context("declaring catalog")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                print_plan(&manifest.catalog)?;
            }
        }
        Command::Apply { noop, json } => {
            let manifest = Manifest::for_host(&host, &sources, &config, &overrides, &store)
                .context("declaring catalog")?;

            let mut host = host;
            host.set_family(manifest.facts.os_family);
            let report = Applier::new(&mut host)
                .noop(noop)
                .apply(&manifest.catalog)
                .context("applying catalog")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if !report.is_success() {
                warn!(failed = report.summary.failed, "convergence incomplete");
                std::process::exit(EXIT_RESOURCE_FAILED);
            }
            info!("host converged");
        }
    }

    Ok(())
}

fn print_facts(facts: &HostFacts) {
    println!("os_family:        {}", facts.os_family);
    println!("release:          {}", facts.release_name);
    println!(
        "memory:           {} ({} MB)",
        format_bytes(facts.total_memory),
        facts.total_memory_mb
    );
    println!("postgres_version: {}", facts.postgres_version);
    println!("package:          {}", facts.package_name);
}

fn print_tuning(facts: &HostFacts, plan: &TuningPlan) {
    let strategy = match plan.strategy {
        Strategy::Legacy => "legacy (pgtune)",
        Strategy::Modern => "modern (rendered)",
    };
    println!("strategy: {} for release {}", strategy, facts.release_name);
    println!();

    match plan.strategy {
        Strategy::Legacy => {
            let shm = &plan.shared_memory;
            println!("  kernel.shmmax            {}", shm.half_memory);
            println!("  kernel.shmall            {}", shm.half_memory_pages);
            println!("  pgtune -M                {}", shm.half_memory);
        }
        Strategy::Modern => {
            let d = &plan.derived;
            println!("  shared_buffers           {}", format_mb(d.shared_buffers_mb));
            println!("  work_mem                 {}", format_mb(d.work_mem_mb));
            println!(
                "  maintenance_work_mem     {}",
                format_mb(d.maintenance_work_mem_mb)
            );
            println!(
                "  effective_cache_size     {}",
                format_mb(d.effective_cache_size_mb)
            );
        }
    }

    let set: Vec<_> = plan
        .overrides
        .entries()
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();
    if !set.is_empty() {
        println!();
        println!("overrides:");
        for (name, value) in set {
            println!("  {:<24} {}", name, value);
        }
    }
}

fn print_plan(catalog: &Catalog) -> Result<()> {
    let order = catalog.order()?;
    for (i, resource) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, resource.id);
        match &resource.kind {
            ResourceKind::Package { .. } => {}
            ResourceKind::File { ownership, .. } | ResourceKind::Directory { ownership, .. } => {
                if let Some(line) = describe_ownership(ownership) {
                    println!("       {}", line);
                }
            }
            ResourceKind::Exec {
                command,
                refresh_only,
                unless,
            } => {
                if command != &resource.id.title {
                    println!("       command: {}", truncate(command, 96));
                }
                if *refresh_only {
                    println!("       refresh only");
                }
                if let Some(guard) = unless {
                    println!("       unless: {}", guard);
                }
            }
        }
        for dep in &resource.require {
            println!("       require   {}", dep);
        }
        for dep in &resource.subscribe {
            println!("       subscribe {}", dep);
        }
        for dep in &resource.after {
            println!("       after     {}", dep);
        }
    }
    Ok(())
}

/// `owner:group mode`, or `None` when nothing is managed.
fn describe_ownership(ownership: &Ownership) -> Option<String> {
    if *ownership == Ownership::default() {
        return None;
    }
    let owner = ownership.owner.as_deref().unwrap_or("-");
    let group = ownership.group.as_deref().unwrap_or("-");
    let mode = ownership.mode.map(format_mode).unwrap_or_else(|| "-".into());
    Some(format!("{}:{} {}", owner, group, mode))
}

fn print_report(report: &Report) {
    for entry in &report.resources {
        let (label, reason) = match &entry.outcome {
            Outcome::Unchanged => ("unchanged", None),
            Outcome::Changed => ("changed", entry.detail.as_deref()),
            Outcome::Failed(reason) => ("FAILED", Some(reason.as_str())),
            Outcome::Skipped(reason) => ("skipped", Some(reason.as_str())),
        };
        match reason {
            Some(reason) => println!("{:<10} {}: {}", label, entry.id, reason),
            None => println!("{:<10} {}", label, entry.id),
        }
    }

    let s = &report.summary;
    let elapsed = report.finished_at - report.started_at;
    println!();
    println!(
        "{}{} changed, {} unchanged, {} failed, {} skipped in {} ms",
        if report.noop { "(noop) " } else { "" },
        s.changed,
        s.unchanged,
        s.failed,
        s.skipped,
        elapsed.num_milliseconds()
    );
}
