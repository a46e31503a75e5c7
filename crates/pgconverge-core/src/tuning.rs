//! Memory-derived PostgreSQL parameters and operator overrides.

use serde::Serialize;

use crate::config::{ConfigSource, POSTGRESQL_SECTION};
use crate::facts::HostFacts;

/// Release codename that still uses the external `pgtune` utility.
pub const LEGACY_RELEASE: &str = "trusty";

/// Page size used for `kernel.shmall`.
pub const SHM_PAGE_SIZE: u64 = 4096;

/// How the final `postgresql.conf` is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Render a template, run `pgtune` over it and raise kernel SHM limits.
    Legacy,
    /// Compute the parameters here and render the final file directly.
    Modern,
}

impl Strategy {
    pub fn for_release(release_name: &str) -> Self {
        if release_name == LEGACY_RELEASE {
            Strategy::Legacy
        } else {
            Strategy::Modern
        }
    }
}

/// Kernel shared memory limits for the legacy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SharedMemory {
    /// Half of physical memory in bytes (`kernel.shmmax`, pgtune `-M`).
    pub half_memory: u64,
    /// `half_memory` in 4 KiB pages (`kernel.shmall`).
    pub half_memory_pages: u64,
}

impl SharedMemory {
    pub fn from_total(total_memory: u64) -> Self {
        let half_memory = total_memory / 2;
        Self {
            half_memory,
            half_memory_pages: half_memory / SHM_PAGE_SIZE,
        }
    }
}

/// Parameters derived from total memory in MB. All values are in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivedTuning {
    pub work_mem_mb: u64,
    pub shared_buffers_mb: u64,
    pub effective_cache_size_mb: u64,
    pub maintenance_work_mem_mb: u64,
}

impl DerivedTuning {
    pub fn from_total_mb(total_memory_mb: u64) -> Self {
        Self {
            work_mem_mb: total_memory_mb / 512,
            shared_buffers_mb: total_memory_mb / 8,
            effective_cache_size_mb: total_memory_mb * 10 / 32,
            maintenance_work_mem_mb: total_memory_mb / 32,
        }
    }
}

/// Operator-supplied settings; absent values fall back to template defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserOverrides {
    pub random_page_cost: Option<String>,
    pub effective_io_concurrency: Option<String>,
    pub replication: Option<String>,
    pub listen_addresses: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub ssl_ca_file: Option<String>,
}

impl UserOverrides {
    /// Reads every override from the `[postgresql]` section.
    pub fn from_config(config: &dyn ConfigSource) -> Self {
        let get = |key: &str| config.get(POSTGRESQL_SECTION, key);
        Self {
            random_page_cost: get("random_page_cost"),
            effective_io_concurrency: get("effective_io_concurrency"),
            replication: get("replication"),
            listen_addresses: get("listen_addresses"),
            ssl_cert_file: get("ssl_cert_file"),
            ssl_key_file: get("ssl_key_file"),
            ssl_ca_file: get("ssl_ca_file"),
        }
    }

    /// `(name, value)` pairs in a fixed order, absent values included.
    pub fn entries(&self) -> [(&'static str, Option<&str>); 7] {
        [
            ("random_page_cost", self.random_page_cost.as_deref()),
            (
                "effective_io_concurrency",
                self.effective_io_concurrency.as_deref(),
            ),
            ("replication", self.replication.as_deref()),
            ("listen_addresses", self.listen_addresses.as_deref()),
            ("ssl_cert_file", self.ssl_cert_file.as_deref()),
            ("ssl_key_file", self.ssl_key_file.as_deref()),
            ("ssl_ca_file", self.ssl_ca_file.as_deref()),
        ]
    }
}

/// Everything the tuning step decides for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TuningPlan {
    pub strategy: Strategy,
    pub shared_memory: SharedMemory,
    pub derived: DerivedTuning,
    pub overrides: UserOverrides,
}

impl TuningPlan {
    pub fn compute(facts: &HostFacts, config: &dyn ConfigSource) -> Self {
        Self {
            strategy: Strategy::for_release(&facts.release_name),
            shared_memory: SharedMemory::from_total(facts.total_memory),
            derived: DerivedTuning::from_total_mb(facts.total_memory_mb),
            overrides: UserOverrides::from_config(config),
        }
    }
}
