//! Process liveness and detached spawning.

use crate::error::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// PID of the calling process.
pub fn current_pid() -> u64 {
    std::process::id() as u64
}

/// Whether `pid` names a live process. Signal 0 probes without delivering.
pub fn is_alive(pid: u64) -> bool {
    if pid == 0 || pid > i32::MAX as u64 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Spawn the broker executable detached from the calling process: its own
/// session, no inherited stdio, not reaped by us.
pub fn spawn_detached(path: &Path, args: &[String]) -> Result<u32> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn()?;
    let pid = child.id();
    info!(%pid, path = %path.display(), "spawned broker");
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_is_alive() {
        assert!(is_alive(current_pid()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!is_alive(0));
    }

    #[test]
    fn exited_child_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as u64;
        child.wait().unwrap();
        // Reaped child: the PID no longer names a live process.
        assert!(!is_alive(pid));
    }
}
