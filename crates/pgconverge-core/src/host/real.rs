use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt, fchown};
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use tracing::{debug, trace};

use super::{CommandOutput, FileMeta, Host, MetaUpdate};
use crate::facts::parser::parse_id_database;
use crate::layout::OsFamily;

/// Host implementation that acts on the local machine.
///
/// Package operations need to know the OS family; until [`RealHost::set_family`]
/// is called they fail with an error.
#[derive(Debug, Clone)]
pub struct RealHost {
    family: Option<OsFamily>,
    passwd_path: PathBuf,
    group_path: PathBuf,
}

impl Default for RealHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RealHost {
    pub fn new() -> Self {
        Self {
            family: None,
            passwd_path: PathBuf::from("/etc/passwd"),
            group_path: PathBuf::from("/etc/group"),
        }
    }

    /// Selects the package manager (`apt`/`dpkg` or `dnf`/`rpm`).
    pub fn set_family(&mut self, family: OsFamily) {
        self.family = Some(family);
    }

    fn family(&self) -> io::Result<OsFamily> {
        self.family
            .ok_or_else(|| io::Error::other("package manager not configured for this host"))
    }

    fn lookup_id(&self, path: &Path, name: &str) -> Option<u32> {
        if let Ok(id) = name.parse::<u32>() {
            return Some(id);
        }
        let content = fs::read_to_string(path).ok()?;
        parse_id_database(&content).get(name).copied()
    }
}

fn capture(command: &mut Command) -> io::Result<CommandOutput> {
    let output = command.output()?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Mode of a file created from scratch.
const NEW_FILE_MODE: u32 = 0o644;

impl Host for RealHost {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let meta = fs::metadata(path)?;
        Ok(FileMeta {
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    /// Replaces `path` atomically: the content goes to a temporary sibling,
    /// is synced, and is renamed over the target. The temporary file is
    /// removed on every error path.
    fn write_file(&mut self, path: &Path, content: &str) -> io::Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let existing = fs::metadata(path).ok();

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        match existing {
            Some(meta) => {
                tmp.as_file().set_permissions(meta.permissions())?;
                fchown(tmp.as_file(), Some(meta.uid()), Some(meta.gid()))?;
            }
            None => tmp
                .as_file()
                .set_permissions(fs::Permissions::from_mode(NEW_FILE_MODE))?,
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), bytes = content.len(), "wrote file");
        Ok(())
    }

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn set_metadata(&mut self, path: &Path, update: &MetaUpdate) -> io::Result<()> {
        if update.uid.is_some() || update.gid.is_some() {
            std::os::unix::fs::chown(path, update.uid, update.gid)?;
        }
        if let Some(mode) = update.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn run(&mut self, command: &str) -> io::Result<CommandOutput> {
        trace!(command, "running");
        capture(Command::new("sh").arg("-c").arg(command))
    }

    fn package_installed(&self, name: &str) -> io::Result<bool> {
        match self.family()? {
            OsFamily::Debian => {
                let out = capture(
                    Command::new("dpkg-query")
                        .args(["-W", "-f=${Status}"])
                        .arg(name),
                )?;
                Ok(out.success() && out.stdout.contains("install ok installed"))
            }
            OsFamily::RedHat => {
                let out = capture(Command::new("rpm").arg("-q").arg(name))?;
                Ok(out.success())
            }
        }
    }

    fn install_package(&mut self, name: &str) -> io::Result<CommandOutput> {
        match self.family()? {
            OsFamily::Debian => capture(
                Command::new("apt-get")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .args(["install", "-y", "-q"])
                    .arg(name),
            ),
            OsFamily::RedHat => capture(Command::new("dnf").args(["install", "-y"]).arg(name)),
        }
    }

    fn resolve_user(&self, name: &str) -> Option<u32> {
        self.lookup_id(&self.passwd_path, name)
    }

    fn resolve_group(&self, name: &str) -> Option<u32> {
        self.lookup_id(&self.group_path, name)
    }
}
