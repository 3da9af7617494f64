//! Running the guest: process supervision, vCPU pinning, exit decoding.

pub mod affinity;
pub mod exit;
pub mod supervisor;

pub use exit::ExitResult;
