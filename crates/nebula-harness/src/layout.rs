//! Working directory layout: staging binaries, configs and credentials, and
//! reading back PID files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::params::RESOURCES_DIR;
use crate::{Error, Result, Role};

/// Directories created by every install.
pub const INSTALL_DIRS: [&str; 3] = ["bin", "conf", "scripts"];

/// Credential files copied from the source tree's `tests/cert`.
pub const TLS_FILES: [&str; 5] = [
    "test.ca.key",
    "test.ca.pem",
    "test.ca.password",
    "test.derive.key",
    "test.derive.crt",
];

/// Flag metadata file copied next to the credentials.
pub const GFLAGS_FILE: &str = "gflags.json";

/// Where install copies files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSources {
    /// Build output; holds `bin/nebula-*`.
    pub build_dir: PathBuf,

    /// Source checkout; holds `conf/` and `tests/cert/`.
    pub src_dir: PathBuf,
}

impl InstallSources {
    pub fn new(build_dir: impl Into<PathBuf>, src_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            src_dir: src_dir.into(),
        }
    }

    pub fn binary(&self, role: Role) -> PathBuf {
        self.build_dir.join("bin").join(role.binary_name())
    }

    pub fn conf_template(&self, role: Role) -> PathBuf {
        self.src_dir.join("conf").join(role.default_conf_name())
    }

    pub fn gflags(&self) -> PathBuf {
        self.build_dir.join("..").join("resources").join(GFLAGS_FILE)
    }

    pub fn cert(&self, name: &str) -> PathBuf {
        self.src_dir.join("tests").join("cert").join(name)
    }
}

/// Recreates `work_dir` from scratch and stages every file a node needs.
///
/// Previous contents are removed, not merged. A missing source file is
/// fatal.
pub fn install(sources: &InstallSources, work_dir: &Path) -> Result<()> {
    if work_dir.exists() {
        fs::remove_dir_all(work_dir).map_err(|e| Error::io(work_dir, e))?;
    }
    fs::create_dir_all(work_dir).map_err(|e| Error::io(work_dir, e))?;

    for dir in INSTALL_DIRS {
        let path = work_dir.join(dir);
        fs::create_dir(&path).map_err(|e| Error::io(&path, e))?;
    }

    for role in Role::ALL {
        copy_file(&sources.binary(role), &work_dir.join("bin").join(role.binary_name()))?;
        copy_file(
            &sources.conf_template(role),
            &work_dir.join("conf").join(role.conf_name()),
        )?;
    }

    let resources = work_dir.join(RESOURCES_DIR);
    fs::create_dir_all(&resources).map_err(|e| Error::io(&resources, e))?;

    copy_file(&sources.gflags(), &resources.join(GFLAGS_FILE))?;
    for name in TLS_FILES {
        copy_file(&sources.cert(name), &resources.join(name))?;
    }

    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if !from.is_file() {
        return Err(Error::MissingSource(from.to_path_buf()));
    }
    // fs::copy carries the permission bits, so binaries stay executable.
    fs::copy(from, to).map_err(|e| Error::io(from, e))?;
    Ok(())
}

/// Creates `logs{i}/` and `pids{i}/` for `i < count`.
pub fn create_instance_dirs(work_dir: &Path, count: usize) -> Result<()> {
    for index in 0..count {
        for prefix in ["logs", "pids"] {
            let path = work_dir.join(format!("{prefix}{index}"));
            fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        }
    }
    Ok(())
}

/// Reads every `pid*/*.pid` file under `work_dir`.
///
/// The first line of each file is the PID. Unreadable or malformed files are
/// skipped.
pub fn collect_pids(work_dir: &Path) -> BTreeMap<PathBuf, u32> {
    let mut pids = BTreeMap::new();

    let Ok(entries) = fs::read_dir(work_dir) else {
        return pids;
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        let is_pid_dir = dir.is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("pid"));
        if !is_pid_dir {
            continue;
        }

        let Ok(files) = fs::read_dir(&dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            match read_pid_file(&path) {
                Some(pid) => {
                    pids.insert(path, pid);
                }
                None => {
                    tracing::debug!(path = %path.display(), "skipping unreadable pid file");
                }
            }
        }
    }

    pids
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().next()?.trim().parse().ok()
}
