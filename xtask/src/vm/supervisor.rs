//! Emulator process lifetime.
//!
//! The child shares the terminal (stdin/stdout/stderr inherited) and is tied
//! to this process: if the orchestrator dies first the kernel delivers
//! SIGKILL to the child.

use crate::error::LaunchError;
use crate::qemu::CommandLine;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Child, Stdio};

use super::exit::raw_status;

/// A running emulator. Owned by the supervisor until [`GuestProcess::wait`].
#[derive(Debug)]
pub struct GuestProcess {
    child: Child,
}

impl GuestProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the emulator exits and return its raw status.
    ///
    /// There is no timeout: a guest may legitimately run forever.
    pub fn wait(mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait for pid {}", self.child.id()))?;
        tracing::debug!(%status, "emulator exited");
        Ok(raw_status(status))
    }
}

/// Spawn `cmdline` in `cwd` with console I/O inherited.
///
/// On Linux the parent-death signal fires when the *calling thread* exits,
/// not only the process. Call this from a thread that outlives the guest
/// (the main thread); spawning from a short-lived worker kills the guest
/// as soon as the worker returns.
pub fn spawn(cmdline: &CommandLine, cwd: &Path) -> Result<GuestProcess> {
    let mut cmd = cmdline.to_command();
    cmd.current_dir(cwd)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt as _;
        let parent = std::process::id() as libc::pid_t;
        // SAFETY: the hook only makes async-signal-safe calls
        unsafe {
            cmd.pre_exec(move || die_with_parent(parent));
        }
    }

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: cmdline.to_string(),
        source,
    })?;
    tracing::debug!(pid = child.id(), "spawned {}", cmdline.program);

    Ok(GuestProcess { child })
}

/// Runs in the forked child: request SIGKILL when the parent goes away.
#[cfg(target_os = "linux")]
fn die_with_parent(parent: libc::pid_t) -> std::io::Result<()> {
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // The parent may have exited before prctl took effect.
        if libc::getppid() != parent {
            libc::_exit(1);
        }
    }
    Ok(())
}
