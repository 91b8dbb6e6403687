// hardshare daemon - PID file management
//
// Ensures at most one daemon runs per workspace at a time. Scoped by
// workspace id so multiple workspaces can be shared from the same host
// concurrently, each with its own daemon process.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::runtime_dir;

/// PID file guard - automatically removes the PID file on drop.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create a new PID file guard for `workspace_id`.
    ///
    /// Fails if another daemon for the same workspace is already
    /// running. A PID file left behind by a process that's no longer
    /// alive is treated as stale and replaced.
    pub fn create(workspace_id: &str) -> Result<Self> {
        let path = Self::pid_file_path(workspace_id)?;

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if Self::is_process_running(pid) {
                            anyhow::bail!(
                                "hardshare daemon for workspace {} is already running with PID {}. \
                                 Stop it first, or remove {} if it's stale.",
                                workspace_id,
                                pid,
                                path.display()
                            );
                        } else {
                            warn!(
                                "found stale PID file for process {} (not running), removing it",
                                pid
                            );
                            fs::remove_file(&path).context("failed to remove stale PID file")?;
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("failed to write PID file")?;

        info!("created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }

    fn pid_file_path(workspace_id: &str) -> Result<PathBuf> {
        Ok(runtime_dir()?.join(format!("hardshare.{}.pid", workspace_id)))
    }

    /// Check whether a process with the given PID is running.
    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        unsafe {
            let result = libc::kill(pid as i32, 0);
            if result == 0 {
                return true;
            }

            let errno = *libc::__errno_location();
            match errno {
                libc::ESRCH => false,
                libc::EPERM => true,
                _ => false,
            }
        }
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        warn!("process existence check not implemented for this platform");
        true
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("removed PID file: {}", self.path.display()),
            Err(e) => warn!("failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test picks a distinct workspace id so they don't collide on
    // the shared ~/.rerobots runtime directory.

    #[test]
    fn second_guard_for_same_workspace_is_rejected() {
        let _guard1 = PidFileGuard::create("pidtest-a").expect("first instance should succeed");

        let result = PidFileGuard::create("pidtest-a");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already running"));

        drop(_guard1);
        let _guard2 =
            PidFileGuard::create("pidtest-a").expect("should succeed after first is dropped");
    }

    #[test]
    fn distinct_workspaces_do_not_conflict() {
        let _g1 = PidFileGuard::create("pidtest-b").unwrap();
        let _g2 = PidFileGuard::create("pidtest-c").unwrap();
    }

    #[test]
    fn current_process_is_running() {
        let current_pid = std::process::id();
        assert!(PidFileGuard::is_process_running(current_pid));
    }

    #[test]
    fn nonexistent_process_not_running() {
        assert!(!PidFileGuard::is_process_running(999999));
    }
}
