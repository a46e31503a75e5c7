//! In-memory host for testing convergence without touching the machine.
//!
//! `MockHost` keeps files, directories and installed packages in memory,
//! answers commands from a script (exit 0 unless told otherwise) and records
//! every command it was asked to run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use super::{CommandOutput, FileMeta, Host, MetaUpdate};

const DEFAULT_FILE_META: FileMeta = FileMeta {
    mode: 0o644,
    uid: 0,
    gid: 0,
};

const DEFAULT_DIR_META: FileMeta = FileMeta {
    mode: 0o755,
    uid: 0,
    gid: 0,
};

#[derive(Debug, Clone)]
struct MockFile {
    content: String,
    meta: FileMeta,
}

/// In-memory host for testing.
#[derive(Debug, Clone)]
pub struct MockHost {
    files: BTreeMap<PathBuf, MockFile>,
    directories: BTreeMap<PathBuf, FileMeta>,
    packages: BTreeSet<String>,
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
    command_results: HashMap<String, CommandOutput>,
    failing_writes: BTreeSet<PathBuf>,
    /// Every command passed to `run`, in order.
    commands: Vec<String>,
    /// Every package passed to `install_package`, in order.
    installs: Vec<String>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Creates an empty host that only knows about `root`.
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            directories: BTreeMap::new(),
            packages: BTreeSet::new(),
            users: HashMap::from([("root".to_string(), 0)]),
            groups: HashMap::from([("root".to_string(), 0)]),
            command_results: HashMap::new(),
            failing_writes: BTreeSet::new(),
            commands: Vec::new(),
            installs: Vec::new(),
        }
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        let meta = self
            .files
            .get(&path)
            .map(|f| f.meta)
            .unwrap_or(DEFAULT_FILE_META);
        self.files.insert(
            path,
            MockFile {
                content: content.into(),
                meta,
            },
        );
    }

    /// Adds a directory and its parents.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.entry(path).or_insert(DEFAULT_DIR_META);
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories
                    .entry(p.to_path_buf())
                    .or_insert(DEFAULT_DIR_META);
            }
            parent = p.parent();
        }
    }

    pub fn add_package(&mut self, name: impl Into<String>) {
        self.packages.insert(name.into());
    }

    pub fn add_user(&mut self, name: impl Into<String>, uid: u32) {
        self.users.insert(name.into(), uid);
    }

    pub fn add_group(&mut self, name: impl Into<String>, gid: u32) {
        self.groups.insert(name.into(), gid);
    }

    /// Scripts the result of an exact command line.
    pub fn set_command_result(&mut self, command: impl Into<String>, output: CommandOutput) {
        self.command_results.insert(command.into(), output);
    }

    /// Makes writes to `path` fail with `PermissionDenied`.
    pub fn fail_writes_to(&mut self, path: impl Into<PathBuf>) {
        self.failing_writes.insert(path.into());
    }

    /// Current content of a file, if present.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.files.get(path.as_ref()).map(|f| f.content.as_str())
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn installs(&self) -> &[String] {
        &self.installs
    }

    /// Returns `true` if `command` was run at least once.
    pub fn ran(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }

    /// Forgets the command and install log, keeping the host state.
    pub fn clear_log(&mut self) {
        self.commands.clear();
        self.installs.clear();
    }

    /// Evaluates `test -f|-d|-e <path>` against the in-memory filesystem.
    fn eval_test(&self, command: &str) -> Option<bool> {
        let rest = command.strip_prefix("test ")?;
        let (flag, path) = rest.split_once(' ')?;
        let path = Path::new(path.trim());
        match flag {
            "-f" => Some(self.files.contains_key(path)),
            "-d" => Some(self.directories.contains_key(path)),
            "-e" => Some(self.exists(path)),
            _ => None,
        }
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("file not found: {:?}", path),
    )
}

impl Host for MockHost {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| not_found(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.directories.contains_key(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        self.files
            .get(path)
            .map(|f| f.meta)
            .or_else(|| self.directories.get(path).copied())
            .ok_or_else(|| not_found(path))
    }

    fn write_file(&mut self, path: &Path, content: &str) -> io::Result<()> {
        if self.failing_writes.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {:?}", path),
            ));
        }
        if self.directories.contains_key(path) {
            return Err(io::Error::other(format!("is a directory: {:?}", path)));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !self.directories.contains_key(parent)
        {
            return Err(not_found(parent));
        }
        self.add_file(path, content);
        Ok(())
    }

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        if self.files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file exists: {:?}", path),
            ));
        }
        self.add_dir(path);
        Ok(())
    }

    fn set_metadata(&mut self, path: &Path, update: &MetaUpdate) -> io::Result<()> {
        let meta = match self.files.get_mut(path) {
            Some(file) => &mut file.meta,
            None => self
                .directories
                .get_mut(path)
                .ok_or_else(|| not_found(path))?,
        };
        if let Some(mode) = update.mode {
            meta.mode = mode;
        }
        if let Some(uid) = update.uid {
            meta.uid = uid;
        }
        if let Some(gid) = update.gid {
            meta.gid = gid;
        }
        Ok(())
    }

    fn run(&mut self, command: &str) -> io::Result<CommandOutput> {
        self.commands.push(command.to_string());
        if let Some(output) = self.command_results.get(command) {
            return Ok(output.clone());
        }
        match self.eval_test(command) {
            Some(true) | None => Ok(CommandOutput::exit(0)),
            Some(false) => Ok(CommandOutput::exit(1)),
        }
    }

    fn package_installed(&self, name: &str) -> io::Result<bool> {
        Ok(self.packages.contains(name))
    }

    fn install_package(&mut self, name: &str) -> io::Result<CommandOutput> {
        self.installs.push(name.to_string());
        let key = format!("install {name}");
        if let Some(output) = self.command_results.get(&key)
            && !output.success()
        {
            return Ok(output.clone());
        }
        self.packages.insert(name.to_string());
        Ok(CommandOutput::exit(0))
    }

    fn resolve_user(&self, name: &str) -> Option<u32> {
        self.users.get(name).copied()
    }

    fn resolve_group(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_host_add_file() {
        let mut host = MockHost::new();
        host.add_file("/proc/meminfo", "MemTotal: 16384 kB\n");

        assert!(host.exists(Path::new("/proc/meminfo")));
        assert!(host.is_dir(Path::new("/proc")));
        assert_eq!(
            host.read_to_string(Path::new("/proc/meminfo")).unwrap(),
            "MemTotal: 16384 kB\n"
        );
    }

    #[test]
    fn test_mock_host_not_found() {
        let host = MockHost::new();
        let err = host.read_to_string(Path::new("/nonexistent")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_write_keeps_metadata() {
        let mut host = MockHost::new();
        host.add_dir("/etc");
        let path = Path::new("/etc/app.conf");
        host.write_file(path, "a").unwrap();
        host.set_metadata(
            path,
            &MetaUpdate {
                mode: Some(0o600),
                uid: Some(5),
                gid: None,
            },
        )
        .unwrap();
        host.write_file(path, "b").unwrap();

        let meta = host.metadata(path).unwrap();
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.uid, 5);
        assert_eq!(host.file(path), Some("b"));
    }

    #[test]
    fn test_write_needs_parent_dir() {
        let mut host = MockHost::new();
        let path = Path::new("/var/lib/pgsql/16/data/postgresql.conf");
        let err = host.write_file(path, "x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!host.exists(path));
        assert!(!host.is_dir(Path::new("/var/lib/pgsql")));

        host.add_dir("/var/lib/pgsql/16/data");
        host.write_file(path, "x").unwrap();
        assert_eq!(host.file(path), Some("x"));
    }

    #[test]
    fn test_failing_write() {
        let mut host = MockHost::new();
        host.fail_writes_to("/etc/locked");
        let err = host.write_file(Path::new("/etc/locked"), "x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_run_scripts_and_tests() {
        let mut host = MockHost::new();
        host.add_file("/etc/ssl/certs/cert.pem", "pem");
        host.set_command_result("false", CommandOutput::exit(1));

        assert!(host.run("true").unwrap().success());
        assert!(!host.run("false").unwrap().success());
        assert!(host.run("test -f /etc/ssl/certs/cert.pem").unwrap().success());
        assert!(!host.run("test -f /etc/ssl/private/key").unwrap().success());
        assert!(host.run("test -d /etc/ssl").unwrap().success());

        assert_eq!(host.commands().len(), 5);
        assert!(host.ran("true"));
        host.clear_log();
        assert!(host.commands().is_empty());
    }

    #[test]
    fn test_packages() {
        let mut host = MockHost::new();
        assert!(!host.package_installed("pgtune").unwrap());
        host.install_package("pgtune").unwrap();
        assert!(host.package_installed("pgtune").unwrap());
        assert_eq!(host.installs().to_vec(), vec!["pgtune".to_string()]);

        host.set_command_result("install broken", CommandOutput::exit(100));
        assert!(!host.install_package("broken").unwrap().success());
        assert!(!host.package_installed("broken").unwrap());
    }
}
