//! Resource catalog: declared desired state plus the dependency graph.
//!
//! A catalog is a set of resources (packages, files, directories, commands)
//! connected by three kinds of edges:
//!
//! - `require`: the target is evaluated first; if it fails the source is skipped
//! - `subscribe`: as `require`, and the source is refreshed when the target changed
//! - `after`: ordering only, the outcome of the target does not matter
//!
//! ```text
//!   Package[postgresql-16] ──require──▶ File[postgresql.conf]
//!                                              │
//!                                          subscribe
//!                                              ▼
//!                                 Exec[pg_ctlcluster 16 main restart]
//! ```
//!
//! The graph must be acyclic. [`Catalog::order`] returns a deterministic
//! topological order in which the [`Applier`] evaluates it in a single pass.

mod apply;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

pub use apply::{Applier, Outcome, Report, ResourceReport, Summary};

/// Kind of resource, used in resource references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ResourceType {
    Package,
    File,
    Directory,
    Exec,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Package => "Package",
            ResourceType::File => "File",
            ResourceType::Directory => "Directory",
            ResourceType::Exec => "Exec",
        };
        f.write_str(s)
    }
}

/// Unique reference to a resource, displayed as `Type[title]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub rtype: ResourceType,
    pub title: String,
}

impl ResourceId {
    pub fn new(rtype: ResourceType, title: impl Into<String>) -> Self {
        Self {
            rtype,
            title: title.into(),
        }
    }

    pub fn package(name: &str) -> Self {
        Self::new(ResourceType::Package, name)
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::new(ResourceType::File, path.as_ref().display().to_string())
    }

    pub fn directory(path: impl AsRef<Path>) -> Self {
        Self::new(ResourceType::Directory, path.as_ref().display().to_string())
    }

    pub fn exec(title: &str) -> Self {
        Self::new(ResourceType::Exec, title)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.rtype, self.title)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Desired ownership and permissions. `None` leaves the attribute unmanaged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

/// What a resource manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceKind {
    Package {
        name: String,
    },
    File {
        path: PathBuf,
        content: String,
        #[serde(flatten)]
        ownership: Ownership,
    },
    Directory {
        path: PathBuf,
        #[serde(flatten)]
        ownership: Ownership,
    },
    Exec {
        command: String,
        /// Only run when a subscribed resource changed in this run.
        refresh_only: bool,
        /// Skip the command when this guard command exits 0.
        unless: Option<String>,
    },
}

/// A declared unit of desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub require: Vec<ResourceId>,
    pub subscribe: Vec<ResourceId>,
    pub after: Vec<ResourceId>,
}

impl Resource {
    fn with_kind(id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            require: Vec::new(),
            subscribe: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn package(name: &str) -> Self {
        Self::with_kind(
            ResourceId::package(name),
            ResourceKind::Package {
                name: name.to_string(),
            },
        )
    }

    pub fn file(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        Self::with_kind(
            ResourceId::file(&path),
            ResourceKind::File {
                path,
                content: content.into(),
                ownership: Ownership::default(),
            },
        )
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::with_kind(
            ResourceId::directory(&path),
            ResourceKind::Directory {
                path,
                ownership: Ownership::default(),
            },
        )
    }

    /// Command titled by the command line itself.
    pub fn exec(command: impl Into<String>) -> Self {
        let command = command.into();
        Self::with_kind(
            ResourceId::exec(&command),
            ResourceKind::Exec {
                command,
                refresh_only: false,
                unless: None,
            },
        )
    }

    /// Command with a short title distinct from the command line.
    pub fn named_exec(title: &str, command: impl Into<String>) -> Self {
        Self::with_kind(
            ResourceId::exec(title),
            ResourceKind::Exec {
                command: command.into(),
                refresh_only: false,
                unless: None,
            },
        )
    }

    pub fn require(mut self, id: ResourceId) -> Self {
        self.require.push(id);
        self
    }

    pub fn subscribe(mut self, id: ResourceId) -> Self {
        self.subscribe.push(id);
        self
    }

    pub fn after(mut self, id: ResourceId) -> Self {
        self.after.push(id);
        self
    }

    /// Marks an exec as refresh-only. No effect on other kinds.
    pub fn refresh_only(mut self) -> Self {
        if let ResourceKind::Exec { refresh_only, .. } = &mut self.kind {
            *refresh_only = true;
        }
        self
    }

    /// Sets the guard of an exec. No effect on other kinds.
    pub fn unless(mut self, guard: impl Into<String>) -> Self {
        if let ResourceKind::Exec { unless, .. } = &mut self.kind {
            *unless = Some(guard.into());
        }
        self
    }

    fn ownership_mut(&mut self) -> Option<&mut Ownership> {
        match &mut self.kind {
            ResourceKind::File { ownership, .. } | ResourceKind::Directory { ownership, .. } => {
                Some(ownership)
            }
            _ => None,
        }
    }

    pub fn owner(mut self, owner: &str) -> Self {
        if let Some(o) = self.ownership_mut() {
            o.owner = Some(owner.to_string());
        }
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        if let Some(o) = self.ownership_mut() {
            o.group = Some(group.to_string());
        }
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        if let Some(o) = self.ownership_mut() {
            o.mode = Some(mode);
        }
        self
    }

    /// All resources this one must be evaluated after.
    pub fn dependencies(&self) -> impl Iterator<Item = &ResourceId> {
        self.prerequisites().chain(self.after.iter())
    }

    /// Resources that must succeed for this one to be evaluated.
    pub fn prerequisites(&self) -> impl Iterator<Item = &ResourceId> {
        self.require.iter().chain(self.subscribe.iter())
    }
}

/// Error type for catalog construction and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    Duplicate(ResourceId),
    UnknownReference { from: ResourceId, to: ResourceId },
    /// Resources that take part in, or depend on, a dependency cycle.
    Cycle(Vec<ResourceId>),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Duplicate(id) => write!(f, "duplicate declaration of {}", id),
            CatalogError::UnknownReference { from, to } => {
                write!(f, "{} depends on undeclared {}", from, to)
            }
            CatalogError::Cycle(ids) => {
                let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "dependency cycle among: {}", names.join(", "))
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Ordered collection of resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    resources: Vec<Resource>,
    #[serde(skip)]
    index: HashMap<ResourceId, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a resource. Each id may be declared once.
    pub fn add(&mut self, resource: Resource) -> Result<(), CatalogError> {
        if self.index.contains_key(&resource.id) {
            return Err(CatalogError::Duplicate(resource.id));
        }
        self.index.insert(resource.id.clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Topological evaluation order (Kahn's algorithm).
    ///
    /// Among resources whose dependencies are all satisfied, the one declared
    /// first goes first, so the order is stable for a given catalog.
    pub fn order(&self) -> Result<Vec<&Resource>, CatalogError> {
        let n = self.resources.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, resource) in self.resources.iter().enumerate() {
            for dep in resource.dependencies() {
                let &d = self
                    .index
                    .get(dep)
                    .ok_or_else(|| CatalogError::UnknownReference {
                        from: resource.id.clone(),
                        to: dep.clone(),
                    })?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(i)) = ready.pop() {
            order.push(&self.resources[i]);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < n {
            let stuck = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, &deg)| deg > 0)
                .map(|(i, _)| self.resources[i].id.clone())
                .collect();
            return Err(CatalogError::Cycle(stuck));
        }

        Ok(order)
    }
}
