//! Launch configuration and the optional `run.toml` settings file.
//!
//! [`LaunchConfig`] is built once from validated arguments and never mutated;
//! [`Settings`] carries the host-side paths and helper commands.

use crate::cli::{Cli, Nic};
use crate::error::LaunchError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "run.toml";

/// The only machine target that can actually be run.
pub const QEMU_MACHINE: &str = "qemu";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Machine {
    Qemu,
    /// Accepted by the parser, rejected when it comes to running.
    Other(String),
}

/// Everything the planner and command builder need for one launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    pub machine: Machine,
    pub core_count: u32,
    /// 0 means no NUMA topology.
    pub node_count: u32,
    pub total_memory_mib: u64,
    pub enable_affinity: bool,
    pub enable_monitor: bool,
    pub debug_cpu: bool,
    pub nic: Nic,
    /// Extra emulator arguments, already tokenized.
    pub extra_settings: Vec<String>,
    pub verbose: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            machine: Machine::Qemu,
            core_count: 1,
            node_count: 0,
            total_memory_mib: 1024,
            enable_affinity: false,
            enable_monitor: false,
            debug_cpu: false,
            nic: Nic::default(),
            extra_settings: Vec::new(),
            verbose: false,
        }
    }
}

impl LaunchConfig {
    /// Validate the parsed arguments.
    ///
    /// QEMU-only flags combined with another machine are rejected here, before
    /// anything gets built.
    pub fn from_cli(cli: &Cli) -> Result<Self, LaunchError> {
        let machine = if cli.machine == QEMU_MACHINE {
            Machine::Qemu
        } else {
            let flags = qemu_only_flags(cli);
            if !flags.is_empty() {
                return Err(LaunchError::QemuFlagsForeignMachine {
                    machine: cli.machine.clone(),
                    flags: flags.join(", "),
                });
            }
            Machine::Other(cli.machine.clone())
        };

        let mut extra_settings = cli
            .qemu_settings
            .as_deref()
            .map(split_settings)
            .unwrap_or_default();
        extra_settings.extend(cli.qemu_args.iter().cloned());

        Ok(Self {
            machine,
            core_count: cli.qemu_cores.unwrap_or(1),
            node_count: cli.qemu_nodes.unwrap_or(0),
            total_memory_mib: cli.qemu_memory,
            enable_affinity: cli.qemu_affinity,
            enable_monitor: cli.qemu_monitor,
            debug_cpu: cli.qemu_debug_cpu,
            nic: cli.nic,
            extra_settings,
            verbose: cli.verbose,
        })
    }

    /// True when a per-node NUMA layout is requested and meaningful.
    pub fn wants_numa(&self) -> bool {
        self.node_count > 0 && self.core_count > 1
    }
}

/// Naive whitespace split of `--qemu-settings`. Quotes are not interpreted.
pub fn split_settings(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn qemu_only_flags(cli: &Cli) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if cli.qemu_debug_cpu {
        flags.push("--qemu-debug-cpu");
    }
    if cli.qemu_settings.is_some() {
        flags.push("--qemu-settings");
    }
    if !cli.qemu_args.is_empty() {
        flags.push("--qemu-arg");
    }
    if cli.qemu_monitor {
        flags.push("--qemu-monitor");
    }
    if cli.qemu_cores.is_some() {
        flags.push("--qemu-cores");
    }
    if cli.qemu_nodes.is_some() {
        flags.push("--qemu-nodes");
    }
    if cli.qemu_affinity {
        flags.push("--qemu-affinity");
    }
    flags
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub qemu: QemuSettings,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub affinity: AffinitySettings,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct QemuSettings {
    #[serde(default = "default_qemu_binary")]
    pub binary: String,

    #[serde(default = "default_kernel")]
    pub kernel: String,

    #[serde(default = "default_disk")]
    pub disk: String,

    #[serde(default = "default_serial_log")]
    pub serial_log: String,

    /// host:port of the telnet monitor enabled by `--qemu-monitor`.
    #[serde(default = "default_monitor")]
    pub monitor: String,
}

impl Default for QemuSettings {
    fn default() -> Self {
        QemuSettings {
            binary: default_qemu_binary(),
            kernel: default_kernel(),
            disk: default_disk(),
            serial_log: default_serial_log(),
            monitor: default_monitor(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct BuildSettings {
    /// Working directory of the build, relative to the repository root.
    #[serde(default = "default_build_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_build_command")]
    pub command: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        BuildSettings {
            dir: default_build_dir(),
            command: default_build_command(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct AffinitySettings {
    /// Core allocation helper; computed in-process when not on PATH.
    #[serde(default = "default_corealloc")]
    pub corealloc: String,

    /// Privileged pinning helper, invoked as `<helper...> -k <cores...> -- <pid>`.
    #[serde(default = "default_affinity_helper")]
    pub helper: Vec<String>,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
}

impl Default for AffinitySettings {
    fn default() -> Self {
        AffinitySettings {
            corealloc: default_corealloc(),
            helper: default_affinity_helper(),
            ready_timeout_ms: default_ready_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            fallback_delay_ms: default_fallback_delay_ms(),
        }
    }
}

fn default_qemu_binary() -> String {
    "qemu-system-x86_64".to_string()
}
fn default_kernel() -> String {
    "./o.qemu/kernel.elf".to_string()
}
fn default_disk() -> String {
    "./o.qemu/fs.img".to_string()
}
fn default_serial_log() -> String {
    "serial.log".to_string()
}
fn default_monitor() -> String {
    "127.0.0.1:55555".to_string()
}
fn default_build_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_build_command() -> Vec<String> {
    vec!["make".to_string()]
}
fn default_corealloc() -> String {
    "corealloc".to_string()
}
fn default_affinity_helper() -> Vec<String> {
    ["sudo", "python3", "./qemu_affinity.py"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
fn default_ready_timeout_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_fallback_delay_ms() -> u64 {
    2_000
}

impl Settings {
    /// Load settings from `explicit`, or from `run.toml` under `root`.
    ///
    /// Only the implicit file may be missing; then defaults apply.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = root.join(CONFIG_FILE);
                if !path.exists() {
                    return Ok(Settings::default());
                }
                path
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(settings)
    }
}
