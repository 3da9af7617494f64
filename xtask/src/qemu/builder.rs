//! QEMU command builder
//!
//! Assembles the emulator argument list from a [`LaunchConfig`] and its
//! [`TopologyPlan`]. The order of the tokens is significant to QEMU's option
//! parser: every `-object`/`-numa` pair for a node precedes `-smp`.

use super::topology::TopologyPlan;
use crate::config::{LaunchConfig, QemuSettings};
use std::fmt;
use std::process::Command;

/// Console multiplexer id shared by the serial port and the monitor.
const CONSOLE_CHARDEV: &str = "char0";

/// Host → guest TCP forwards (telnet-style shell, HTTP).
const PORT_REDIRECTS: [&str; 2] = ["tcp:2323::23", "tcp:8080::80"];

/// Name tag that also turns on per-vCPU thread names on the host.
const GUEST_NAME: &str = "sv6,debug-threads=on";

/// Program plus its ordered argument tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Program followed by arguments, as one token list.
    pub fn tokens(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// QEMU command builder over an immutable launch description.
#[derive(Clone, Copy, Debug)]
pub struct QemuBuilder<'a> {
    settings: &'a QemuSettings,
    config: &'a LaunchConfig,
    plan: &'a TopologyPlan,
}

impl<'a> QemuBuilder<'a> {
    pub fn new(settings: &'a QemuSettings, config: &'a LaunchConfig, plan: &'a TopologyPlan) -> Self {
        Self {
            settings,
            config,
            plan,
        }
    }

    /// Build the QEMU command line
    pub fn build(self) -> CommandLine {
        let mut args: Vec<String> = Vec::new();
        let mut push = |tokens: &[&str]| args.extend(tokens.iter().map(|t| (*t).to_string()));

        // Machine: stop instead of rebooting, KVM, host CPU model
        push(&["-no-reboot", "-enable-kvm", "-cpu", "host"]);

        // Serial + monitor multiplexed on stdio, mirrored to the serial log
        let chardev = format!(
            "stdio,id={CONSOLE_CHARDEV},mux=on,logfile={},signal=off",
            self.settings.serial_log
        );
        let serial = format!("chardev:{CONSOLE_CHARDEV}");
        let mon = format!("chardev={CONSOLE_CHARDEV}");
        push(&["-chardev", &chardev, "-serial", &serial, "-mon", &mon]);

        // Network
        let nic = format!("nic,model={}", self.config.nic.model());
        push(&["-net", "user", "-net", &nic]);
        for redirect in PORT_REDIRECTS {
            push(&["-redir", redirect]);
        }

        // Disk on an AHCI controller
        let drive = format!(
            "if=none,file={},format=raw,id=drive-sata0-0-0",
            self.settings.disk
        );
        push(&[
            "-device",
            "ahci,id=ahci0",
            "-drive",
            &drive,
            "-device",
            "ide-drive,bus=ahci0.0,drive=drive-sata0-0-0,id=sata0-0-0",
        ]);

        push(&["-kernel", &self.settings.kernel]);

        // NUMA nodes, each backed by memory bound to a host node
        for node in &self.plan.nodes {
            let memdev = format!(
                "memory-backend-ram,id={},merge=off,dump=on,prealloc=off,size={}M,host-nodes={},policy=bind",
                node.memory_object_id, node.memory_mib, node.host_node_id
            );
            let numa_node = format!("node,memdev={},nodeid={}", node.memory_object_id, node.node_id);
            let numa_cpu = format!("cpu,node-id={0},socket-id={0}", node.node_id);
            push(&["-object", &memdev, "-numa", &numa_node, "-numa", &numa_cpu]);
        }

        // SMP must come after all -numa options
        let smp = if self.plan.is_numa() {
            format!(
                "{},sockets={},maxcpus={}",
                self.config.core_count, self.plan.smp_sockets, self.plan.smp_max_cpus
            )
        } else {
            format!("{},sockets=1", self.config.core_count)
        };
        push(&["-smp", &smp]);

        push(&["-m", &self.config.total_memory_mib.to_string()]);

        if self.config.debug_cpu {
            push(&["-d", "int,cpu_reset"]);
        }
        if self.config.enable_monitor {
            let monitor = format!("telnet:{},server,nowait", self.settings.monitor);
            push(&["-monitor", &monitor]);
        }

        push(&["-name", GUEST_NAME]);

        args.extend(self.config.extra_settings.iter().cloned());

        CommandLine {
            program: self.settings.binary.clone(),
            args,
        }
    }
}
