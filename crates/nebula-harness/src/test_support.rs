//! Fixtures shared by the unit tests.

use std::fs;
use std::path::Path;

use crate::layout::{InstallSources, TLS_FILES};
use crate::Role;

/// Node stub that daemonizes a `sleep` and records its PID like a real node.
/// Nothing listens, so readiness never succeeds.
pub(crate) const SLEEPING_NODE: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --pid_file=*) pid_file="${arg#--pid_file=}" ;;
  esac
done
echo "$@" > "${pid_file%.pid}.args"
sleep 600 </dev/null >/dev/null 2>&1 &
echo $! > "$pid_file"
"#;

/// Builds a fake build/source tree with every file install copies.
///
/// Binaries are plain text unless replaced with [`write_node_stub`].
pub(crate) fn fake_sources(root: &Path) -> InstallSources {
    let build_dir = root.join("build");
    let src_dir = root.join("src");
    let sources = InstallSources::new(&build_dir, &src_dir);

    fs::create_dir_all(build_dir.join("bin")).expect("Failed to create directory");
    fs::create_dir_all(src_dir.join("conf")).expect("Failed to create directory");
    fs::create_dir_all(src_dir.join("tests/cert")).expect("Failed to create directory");
    fs::create_dir_all(root.join("resources")).expect("Failed to create directory");

    for role in Role::ALL {
        fs::write(sources.binary(role), format!("binary {role}")).expect("Failed to write file");
        fs::write(sources.conf_template(role), format!("--role={role}\n"))
            .expect("Failed to write file");
    }
    fs::write(sources.gflags(), "{}").expect("Failed to write file");
    for name in TLS_FILES {
        fs::write(sources.cert(name), name).expect("Failed to write file");
    }

    sources
}

/// Replaces every role binary in `sources` with an executable shell script.
#[cfg(unix)]
pub(crate) fn write_node_stub(sources: &InstallSources, script: &str) {
    use std::os::unix::fs::PermissionsExt;

    for role in Role::ALL {
        let path = sources.binary(role);
        fs::write(&path, script).expect("Failed to write file");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to set permissions");
    }
}
