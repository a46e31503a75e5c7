//! Pre-built mock hosts for testing.
//!
//! Each scenario is a freshly provisioned machine: PostgreSQL installed with
//! its packaged defaults, nothing converged yet.

use super::mock::MockHost;

const POSTGRES_UID: u32 = 113;
const POSTGRES_GID: u32 = 120;

impl MockHost {
    fn with_postgres_account(mut self) -> Self {
        self.add_user("postgres", POSTGRES_UID);
        self.add_group("postgres", POSTGRES_GID);
        self
    }

    /// Ubuntu 22.04 (jammy) with 8 GiB of RAM and PostgreSQL 14 installed.
    pub fn debian_host() -> Self {
        let mut host = Self::new().with_postgres_account();
        host.add_file(
            "/proc/meminfo",
            "\
MemTotal:        8388608 kB
MemFree:         6291456 kB
MemAvailable:    7340032 kB
Buffers:          131072 kB
Cached:           524288 kB
",
        );
        host.add_file(
            "/etc/os-release",
            "\
PRETTY_NAME=\"Ubuntu 22.04.3 LTS\"
NAME=\"Ubuntu\"
VERSION_ID=\"22.04\"
VERSION_CODENAME=jammy
ID=ubuntu
ID_LIKE=debian
",
        );
        host.add_package("postgresql-14");
        host.add_file(
            "/etc/postgresql/14/main/postgresql.conf",
            "# packaged default\n",
        );
        host.add_dir("/etc/sysctl.d");
        host
    }

    /// Ubuntu 14.04 (trusty) with 4 GiB of RAM and PostgreSQL 9.3 installed.
    pub fn trusty_host() -> Self {
        let mut host = Self::new().with_postgres_account();
        host.add_file("/proc/meminfo", "MemTotal:        4194304 kB\n");
        host.add_file(
            "/etc/os-release",
            "\
NAME=\"Ubuntu\"
VERSION=\"14.04.6 LTS, Trusty Tahr\"
ID=ubuntu
ID_LIKE=debian
VERSION_ID=\"14.04\"
",
        );
        host.add_package("postgresql-9.3");
        host.add_file(
            "/etc/postgresql/9.3/main/postgresql.conf",
            "# packaged default\n",
        );
        host.add_dir("/etc/sysctl.d");
        host
    }

    /// Rocky Linux 9.3 with 16 GiB of RAM and PostgreSQL 16 from PGDG.
    pub fn redhat_host() -> Self {
        let mut host = Self::new().with_postgres_account();
        host.add_file("/proc/meminfo", "MemTotal:       16777216 kB\n");
        host.add_file(
            "/etc/os-release",
            "\
NAME=\"Rocky Linux\"
VERSION=\"9.3 (Blue Onyx)\"
ID=\"rocky\"
ID_LIKE=\"rhel centos fedora\"
VERSION_ID=\"9.3\"
",
        );
        host.add_package("postgresql16-server");
        host.add_file(
            "/var/lib/pgsql/16/data/postgresql.conf",
            "# packaged default\n",
        );
        host.add_dir("/etc/ssl/certs");
        host
    }
}
