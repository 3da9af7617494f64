use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Repository root; build and emulator paths are relative to it.
///
/// `SV6_ROOT` overrides the location baked in at compile time.
pub fn repo_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("SV6_ROOT") {
        return Ok(PathBuf::from(root));
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("sv6-run is expected at <repo>/xtask")
}
