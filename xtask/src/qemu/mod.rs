//! QEMU invocation: topology planning and command construction.

mod builder;
pub mod topology;

pub use builder::{CommandLine, QemuBuilder};
pub use topology::{HostTopology, SysfsHost, TopologyPlan};
