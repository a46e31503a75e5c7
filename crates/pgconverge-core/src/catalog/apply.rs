//! Single-pass evaluation of a catalog against a host.
//!
//! Each resource settles exactly once per run to one of four outcomes. A
//! failure never aborts the run: everything that requires or subscribes to a
//! failed (or skipped) resource is skipped, and unrelated resources proceed.
//! Resources ordered `after` a failure still run.
//!
//! Subscribers are refreshed by changes to what a resource manages (file
//! content, an install, a created directory, a command run). Correcting only
//! mode or ownership is reported as `Changed` but refreshes nothing.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{Catalog, CatalogError, Ownership, Resource, ResourceId, ResourceKind};
use crate::host::{Host, MetaUpdate};

/// Final state of a resource after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    Unchanged,
    Changed,
    Failed(String),
    Skipped(String),
}

impl Outcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Outcome::Changed)
    }

    /// Failed or skipped: dependents must not run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::Skipped(_))
    }
}

/// Per-resource entry of a [`Report`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceReport {
    pub id: ResourceId,
    pub outcome: Outcome,
    /// What changed, or would change in noop mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the change refreshes subscribers.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
    /// xxh3 digest of the desired content, for files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub unchanged: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Result of applying a catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub noop: bool,
    /// Entries in evaluation order.
    pub resources: Vec<ResourceReport>,
    pub summary: Summary,
}

impl Report {
    pub fn outcome(&self, id: &ResourceId) -> Option<&Outcome> {
        self.resources
            .iter()
            .find(|r| &r.id == id)
            .map(|r| &r.outcome)
    }

    /// `true` when no resource failed. Skipped resources only occur below a failure.
    pub fn is_success(&self) -> bool {
        self.summary.failed == 0
    }

    pub fn changed(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources
            .iter()
            .filter(|r| r.outcome.is_changed())
            .map(|r| &r.id)
    }
}

fn summarize(resources: &[ResourceReport]) -> Summary {
    let mut summary = Summary::default();
    for r in resources {
        match r.outcome {
            Outcome::Unchanged => summary.unchanged += 1,
            Outcome::Changed => summary.changed += 1,
            Outcome::Failed(_) => summary.failed += 1,
            Outcome::Skipped(_) => summary.skipped += 1,
        }
    }
    summary
}

/// Result of evaluating one resource.
struct Evaluation {
    outcome: Outcome,
    detail: Option<String>,
    refresh: bool,
}

impl Evaluation {
    fn new(outcome: Outcome, detail: Option<String>, refresh: bool) -> Self {
        Self {
            outcome,
            detail,
            refresh,
        }
    }
}

fn changed(detail: impl Into<String>) -> Evaluation {
    Evaluation::new(Outcome::Changed, Some(detail.into()), true)
}

/// Mode or ownership only.
fn metadata_changed(detail: impl Into<String>) -> Evaluation {
    Evaluation::new(Outcome::Changed, Some(detail.into()), false)
}

fn failed(reason: impl Into<String>) -> Evaluation {
    Evaluation::new(Outcome::Failed(reason.into()), None, false)
}

fn skipped(reason: impl Into<String>) -> Evaluation {
    Evaluation::new(Outcome::Skipped(reason.into()), None, false)
}

fn unchanged() -> Evaluation {
    Evaluation::new(Outcome::Unchanged, None, false)
}

/// Applies catalogs to a host.
pub struct Applier<'h, H: Host + ?Sized> {
    host: &'h mut H,
    noop: bool,
}

impl<'h, H: Host + ?Sized> Applier<'h, H> {
    pub fn new(host: &'h mut H) -> Self {
        Self { host, noop: false }
    }

    /// In noop mode nothing is changed on the host; resources that would
    /// change are reported as `Changed` so refreshes still propagate.
    pub fn noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    /// Evaluates every resource once, in dependency order.
    ///
    /// Only an invalid graph is an `Err`; resource failures are in the report.
    pub fn apply(&mut self, catalog: &Catalog) -> Result<Report, CatalogError> {
        let order = catalog.order()?;
        let started_at = Utc::now();
        info!(
            resources = order.len(),
            noop = self.noop,
            "applying catalog"
        );

        let mut outcomes: HashMap<&ResourceId, Outcome> = HashMap::with_capacity(order.len());
        let mut refreshing: HashSet<&ResourceId> = HashSet::new();
        let mut entries = Vec::with_capacity(order.len());

        for resource in order {
            let Evaluation {
                outcome,
                detail,
                refresh,
            } = match blocking_dependency(resource, &outcomes) {
                Some(dep) => skipped(format!("dependency {} did not succeed", dep)),
                None => {
                    let triggered = resource.subscribe.iter().any(|id| refreshing.contains(id));
                    self.evaluate(resource, triggered)
                }
            };

            log_outcome(&resource.id, &outcome, detail.as_deref(), self.noop);

            let digest = match &resource.kind {
                ResourceKind::File { content, .. } => {
                    Some(format!("{:016x}", xxh3_64(content.as_bytes())))
                }
                _ => None,
            };
            entries.push(ResourceReport {
                id: resource.id.clone(),
                outcome: outcome.clone(),
                detail,
                refresh,
                digest,
            });
            if refresh {
                refreshing.insert(&resource.id);
            }
            outcomes.insert(&resource.id, outcome);
        }

        let summary = summarize(&entries);
        info!(
            changed = summary.changed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            skipped = summary.skipped,
            "catalog applied"
        );

        Ok(Report {
            started_at,
            finished_at: Utc::now(),
            noop: self.noop,
            resources: entries,
            summary,
        })
    }

    fn evaluate(&mut self, resource: &Resource, triggered: bool) -> Evaluation {
        match &resource.kind {
            ResourceKind::Package { name } => self.apply_package(name),
            ResourceKind::File {
                path,
                content,
                ownership,
            } => self.apply_file(path, content, ownership),
            ResourceKind::Directory { path, ownership } => self.apply_directory(path, ownership),
            ResourceKind::Exec {
                command,
                refresh_only,
                unless,
            } => self.apply_exec(command, *refresh_only, unless.as_deref(), triggered),
        }
    }

    fn apply_package(&mut self, name: &str) -> Evaluation {
        match self.host.package_installed(name) {
            Ok(true) => unchanged(),
            Ok(false) if self.noop => changed("would install"),
            Ok(false) => match self.host.install_package(name) {
                Ok(out) if out.success() => changed("installed"),
                Ok(out) => failed(format!("install failed: {}", out.describe_failure())),
                Err(e) => failed(format!("install failed: {}", e)),
            },
            Err(e) => failed(format!("cannot query package state: {}", e)),
        }
    }

    fn resolve(&self, ownership: &Ownership) -> Result<MetaUpdate, String> {
        let uid = match &ownership.owner {
            Some(name) => Some(
                self.host
                    .resolve_user(name)
                    .ok_or_else(|| format!("unknown user '{}'", name))?,
            ),
            None => None,
        };
        let gid = match &ownership.group {
            Some(name) => Some(
                self.host
                    .resolve_group(name)
                    .ok_or_else(|| format!("unknown group '{}'", name))?,
            ),
            None => None,
        };
        Ok(MetaUpdate {
            mode: ownership.mode,
            uid,
            gid,
        })
    }

    /// Brings metadata of an existing path in line. Returns whether it changed.
    fn sync_metadata(&mut self, path: &Path, wanted: &MetaUpdate) -> io::Result<bool> {
        if wanted.is_empty() {
            return Ok(false);
        }
        let current = self.host.metadata(path)?;
        if wanted.satisfied_by(&current) {
            return Ok(false);
        }
        if !self.noop {
            self.host.set_metadata(path, wanted)?;
        }
        Ok(true)
    }

    fn apply_file(&mut self, path: &Path, content: &str, ownership: &Ownership) -> Evaluation {
        let wanted = match self.resolve(ownership) {
            Ok(w) => w,
            Err(e) => return failed(e),
        };
        if self.host.is_dir(path) {
            return failed(format!("{} is a directory", path.display()));
        }

        let current = match self.host.read_to_string(path) {
            Ok(c) => Some(c),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return failed(format!("cannot read {}: {}", path.display(), e)),
        };

        let detail = match current.as_deref() {
            None => "created",
            Some(c) if c != content => "content changed",
            Some(_) => "",
        };

        if !detail.is_empty() {
            if self.noop {
                return changed(format!("would be {}", detail));
            }
            if let Err(e) = self.host.write_file(path, content) {
                return failed(format!("cannot write {}: {}", path.display(), e));
            }
        }

        match self.sync_metadata(path, &wanted) {
            Ok(meta_changed) => match (detail.is_empty(), meta_changed) {
                (false, _) => changed(detail),
                (true, true) if self.noop => metadata_changed("metadata would change"),
                (true, true) => metadata_changed("metadata changed"),
                (true, false) => unchanged(),
            },
            Err(e) => failed(format!("cannot set metadata on {}: {}", path.display(), e)),
        }
    }

    fn apply_directory(&mut self, path: &Path, ownership: &Ownership) -> Evaluation {
        let wanted = match self.resolve(ownership) {
            Ok(w) => w,
            Err(e) => return failed(e),
        };

        let created = if self.host.is_dir(path) {
            false
        } else if self.host.exists(path) {
            return failed(format!("{} exists and is not a directory", path.display()));
        } else if self.noop {
            return changed("would be created");
        } else {
            if let Err(e) = self.host.create_dir(path) {
                return failed(format!("cannot create {}: {}", path.display(), e));
            }
            true
        };

        match self.sync_metadata(path, &wanted) {
            Ok(_) if created => changed("created"),
            Ok(true) if self.noop => metadata_changed("metadata would change"),
            Ok(true) => metadata_changed("metadata changed"),
            Ok(false) => unchanged(),
            Err(e) => failed(format!("cannot set metadata on {}: {}", path.display(), e)),
        }
    }

    fn apply_exec(
        &mut self,
        command: &str,
        refresh_only: bool,
        unless: Option<&str>,
        triggered: bool,
    ) -> Evaluation {
        if refresh_only && !triggered {
            return unchanged();
        }

        if let Some(guard) = unless {
            match self.host.run(guard) {
                Ok(out) if out.success() => {
                    debug!(guard, "guard satisfied, not running");
                    return unchanged();
                }
                Ok(_) => {}
                Err(e) => return failed(format!("cannot run guard '{}': {}", guard, e)),
            }
        }

        if self.noop {
            return changed(if triggered { "would run (refresh)" } else { "would run" });
        }

        match self.host.run(command) {
            Ok(out) if out.success() => changed(if triggered { "ran (refresh)" } else { "ran" }),
            Ok(out) => failed(out.describe_failure()),
            Err(e) => failed(format!("cannot run: {}", e)),
        }
    }
}

fn blocking_dependency<'a>(
    resource: &'a Resource,
    outcomes: &HashMap<&ResourceId, Outcome>,
) -> Option<&'a ResourceId> {
    resource
        .prerequisites()
        .find(|id| outcomes.get(id).is_some_and(Outcome::blocks_dependents))
}

fn log_outcome(id: &ResourceId, outcome: &Outcome, detail: Option<&str>, noop: bool) {
    match outcome {
        Outcome::Changed => info!(resource = %id, detail = detail.unwrap_or(""), noop, "changed"),
        Outcome::Unchanged => debug!(resource = %id, "unchanged"),
        Outcome::Failed(reason) => error!(resource = %id, reason = %reason, "failed"),
        Outcome::Skipped(reason) => warn!(resource = %id, reason = %reason, "skipped"),
    }
}
