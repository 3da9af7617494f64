use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// NIC model emulated for the guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Nic {
    #[default]
    #[value(name = "e1000")]
    E1000,
    #[value(name = "virtio")]
    Virtio,
}

impl Nic {
    /// Model name understood by QEMU's `-net nic,model=`.
    pub fn model(self) -> &'static str {
        match self {
            Self::E1000 => "e1000",
            Self::Virtio => "virtio",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sv6-run")]
#[command(about = "Build the sv6 kernel and boot it on a (virtual) machine")]
pub struct Cli {
    /// Increase output verbosity (full command line, full error chains).
    #[arg(short, long)]
    pub verbose: bool,

    /// Only build, don't run.
    #[arg(short = 'n', long)]
    pub norun: bool,

    /// Do a release build.
    #[arg(short, long)]
    pub release: bool,

    /// Which machine to run on.
    #[arg(long, default_value = "qemu")]
    pub machine: String,

    /// Settings file (defaults to run.toml at the repository root).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write a JSON run report (command line + decoded guest exit) to PATH.
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// How many NUMA nodes and sockets (for qemu).
    #[arg(long)]
    pub qemu_nodes: Option<u32>,

    /// How many cores (will get evenly divided among nodes). Defaults to 1.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub qemu_cores: Option<u32>,

    /// How much total memory in MiB (will get evenly divided among nodes).
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u64).range(1..))]
    pub qemu_memory: u64,

    /// Pin QEMU instance to dedicated host cores.
    #[arg(long)]
    pub qemu_affinity: bool,

    /// Pass additional generic QEMU arguments as one string.
    ///
    /// Split on whitespace with no quoting support: a quoted value that
    /// contains spaces ends up as several arguments. Use --qemu-arg for those.
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub qemu_settings: Option<String>,

    /// Pass one additional QEMU argument verbatim (repeatable).
    #[arg(long = "qemu-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub qemu_args: Vec<String>,

    /// Launch the QEMU monitor (for qemu).
    #[arg(long)]
    pub qemu_monitor: bool,

    /// Debug CPU reset (for qemu).
    #[arg(short = 'd', long)]
    pub qemu_debug_cpu: bool,

    /// What NIC model to use for emulation.
    #[arg(long, value_enum, default_value_t = Nic::E1000)]
    pub nic: Nic,
}
