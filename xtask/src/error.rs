//! Typed errors that decide the tool's own exit code.
//!
//! Everything else travels as `anyhow::Error`; `main` looks for a
//! [`LaunchError`] in the chain to pick the exit code.

use std::path::PathBuf;
use std::process::ExitStatus;

/// Exit code for configuration rejected before build or run.
pub const EXIT_CONFIG_REJECTED: u8 = 99;

/// Exit code for any other orchestrator failure.
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Machine {0} not supported")]
    UnsupportedMachine(String),

    #[error("Can't specify QEMU specific arguments for non-qemu hardware (machine {machine}, got {flags})")]
    QemuFlagsForeignMachine { machine: String, flags: String },

    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unreadable host topology at {}: {detail}", .path.display())]
    HostTopology { path: PathBuf, detail: String },

    #[error("kernel build failed ({status})")]
    Build { status: ExitStatus },
}

impl LaunchError {
    /// Process exit code the orchestrator reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            LaunchError::UnsupportedMachine(_) | LaunchError::QemuFlagsForeignMachine { .. } => {
                EXIT_CONFIG_REJECTED
            }
            LaunchError::Spawn { .. }
            | LaunchError::HostTopology { .. }
            | LaunchError::Build { .. } => EXIT_FAILURE,
        }
    }
}

/// Exit code for an error chain, honouring a [`LaunchError`] anywhere in it.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LaunchError>())
        .map_or(EXIT_FAILURE, LaunchError::exit_code)
}
