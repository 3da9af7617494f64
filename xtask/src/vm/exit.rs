//! Guest exit status decoding.
//!
//! The guest reports its outcome through QEMU's debug-exit device, which
//! makes QEMU exit with `(code << 1) | 1`. Shifting the raw status right by
//! one recovers the guest code.

use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;

/// Outcome categories reported by the guest kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestExit {
    Success,
    ReturnFromMain,
    KernelPanic,
    OutOfMemory,
    UnexpectedInterrupt,
    GeneralProtectionFault,
    UnexpectedPageFault,
    UnexpectedProcessExit,
    KernelInitException,
    UnrecoverableError,
    Unknown(i32),
}

impl GuestExit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::ReturnFromMain,
            2 => Self::KernelPanic,
            3 => Self::OutOfMemory,
            4 => Self::UnexpectedInterrupt,
            5 => Self::GeneralProtectionFault,
            6 => Self::UnexpectedPageFault,
            7 => Self::UnexpectedProcessExit,
            8 => Self::KernelInitException,
            9 => Self::UnrecoverableError,
            other => Self::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for GuestExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("[SUCCESS]"),
            Self::ReturnFromMain => f.write_str(
                "[FAIL] ReturnFromMain: main() function returned to arch_independent part.",
            ),
            Self::KernelPanic => f.write_str("[FAIL] Encountered kernel panic."),
            Self::OutOfMemory => f.write_str("[FAIL] Encountered OOM."),
            Self::UnexpectedInterrupt => f.write_str("[FAIL] Encountered unexpected Interrupt."),
            Self::GeneralProtectionFault => f.write_str("[FAIL] General Protection Fault."),
            Self::UnexpectedPageFault => f.write_str("[FAIL] Unexpected Page Fault."),
            Self::UnexpectedProcessExit => f.write_str(
                "[FAIL] Unexpected process exit code when running a user-space test.",
            ),
            Self::KernelInitException => {
                f.write_str("[FAIL] Unexpected exception during kernel initialization.")
            }
            Self::UnrecoverableError => {
                f.write_str("[FAIL] Got unrecoverable error (machine check, double fault).")
            }
            Self::Unknown(code) => write!(f, "[FAIL] Kernel exited with unknown error status {code}."),
        }
    }
}

/// Decoded result of one emulator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExitResult {
    pub semantic_code: i32,
    pub category: GuestExit,
    pub raw_status: i32,
}

impl ExitResult {
    /// Decode a raw emulator status. Total: unmapped codes become `Unknown`.
    pub fn decode(raw_status: i32) -> Self {
        let semantic_code = raw_status >> 1;
        Self {
            semantic_code,
            category: GuestExit::from_code(semantic_code),
            raw_status,
        }
    }

    /// The orchestrator's own exit code for this run.
    ///
    /// Process exit codes are 8 bits wide; out-of-range codes are reported as
    /// a generic failure rather than wrapping around to success.
    pub fn process_exit_code(&self) -> u8 {
        u8::try_from(self.semantic_code).unwrap_or(1)
    }
}

/// Raw status of a finished process: its exit code, or `128 + signal` when
/// it was killed.
pub fn raw_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
