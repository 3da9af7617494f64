//! The kernel/user-space build, run as an opaque external command.

use crate::config::BuildSettings;
use crate::error::LaunchError;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

/// Builds the kernel and disk images with the configured build command.
pub fn build_kernel(settings: &BuildSettings, root: &Path, release: bool) -> Result<()> {
    tracing::info!("Build kernel");

    let Some((program, args)) = settings.command.split_first() else {
        bail!("build command is empty");
    };
    let dir = root.join(&settings.dir);

    let mut cmd = Command::new(program);
    cmd.current_dir(&dir).args(args);
    if release {
        cmd.arg("RELEASE=1");
    }
    tracing::debug!("cd {}", dir.display());
    tracing::debug!("{program} {}", args.join(" "));

    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {program} in {}", dir.display()))?;
    if !status.success() {
        return Err(LaunchError::Build { status }.into());
    }

    Ok(())
}
