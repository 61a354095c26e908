// Detached daemon bootstrap.
//
// The daemon is spawned as a new session leader with closed standard
// descriptors and a reset working directory, then forgotten; whether it is
// "the" daemon is decided solely by its own bind succeeding. Racing
// bootstraps are therefore safe, and the advisory lock below only exists to
// keep a herd of clients from all fork/exec-ing at once.
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use fs2::FileExt;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

/// Candidate executables, tried in order: a sibling of the running binary,
/// the bare name via the search path, then a current-directory fallback.
fn candidates() -> Vec<PathBuf> {
    let mut list = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        list.push(dir.join("crossbar"));
    }
    list.push(PathBuf::from("crossbar"));
    list.push(PathBuf::from("./crossbar"));
    list
}

/// Spawn the daemon detached, trying each candidate until one launches.
/// A successful spawn proves nothing about the bind; the caller reconnects
/// and lets the daemon's own bind decide.
pub fn spawn_daemon(endpoint: &Path) -> Result<(), Error> {
    let lock_path = spawn_lock_path(endpoint);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to open spawn lock")
                .with_path(&lock_path)
                .with_source(err)
        })?;
    if lock_file.try_lock_exclusive().is_err() {
        // Another process is already bootstrapping; let it win.
        debug!(lock = %lock_path.display(), "spawn lock held elsewhere, skipping spawn");
        return Ok(());
    }

    let mut last_err: Option<std::io::Error> = None;
    for candidate in candidates() {
        match spawn_detached(&candidate, endpoint) {
            Ok(()) => {
                debug!(exe = %candidate.display(), "spawned daemon");
                let _ = fs2::FileExt::unlock(&lock_file);
                return Ok(());
            }
            Err(err) => last_err = Some(err),
        }
    }
    let _ = fs2::FileExt::unlock(&lock_file);

    let mut error = Error::new(ErrorKind::Unavailable)
        .with_message("could not start the crossbar daemon")
        .with_hint("Ensure the crossbar executable is installed on PATH.");
    if let Some(source) = last_err {
        error = error.with_source(source);
    }
    Err(error)
}

fn spawn_detached(exe: &Path, endpoint: &Path) -> Result<(), std::io::Error> {
    let mut command = Command::new(exe);
    command
        .arg("daemon")
        .arg("run")
        .arg("--endpoint")
        .arg(endpoint)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir("/");
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session leader: survives the client and owns no terminal.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    command.spawn().map(|_| ())
}

pub fn spawn_lock_path(endpoint: &Path) -> PathBuf {
    let mut path = endpoint.as_os_str().to_owned();
    path.push(".spawn.lock");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::{candidates, spawn_lock_path};
    use std::path::Path;

    #[test]
    fn candidate_order_ends_with_cwd_fallback() {
        let list = candidates();
        assert!(list.len() >= 2);
        assert_eq!(list.last(), Some(&std::path::PathBuf::from("./crossbar")));
    }

    #[test]
    fn lock_path_sits_beside_the_socket() {
        let path = spawn_lock_path(Path::new("/run/user/1000/crossbar-ab.sock"));
        assert_eq!(
            path,
            Path::new("/run/user/1000/crossbar-ab.sock.spawn.lock")
        );
    }
}
