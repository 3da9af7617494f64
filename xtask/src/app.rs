use crate::cli::Cli;
use crate::config::{LaunchConfig, Machine, Settings};
use crate::error::LaunchError;
use crate::qemu::{CommandLine, HostTopology, QemuBuilder, SysfsHost, TopologyPlan};
use crate::vm::affinity::AffinityPinner;
use crate::vm::{supervisor, ExitResult};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Validate, build, run. Returns the process exit code.
pub fn run(cli: &Cli) -> Result<u8> {
    let config = LaunchConfig::from_cli(cli)?;
    let root = crate::util::repo::repo_root()?;
    let settings = Settings::load(&root, cli.config.as_deref())?;

    crate::build::build_kernel(&settings.build, &root, cli.release)?;
    if cli.norun {
        return Ok(0);
    }

    match &config.machine {
        Machine::Qemu => {
            let (cmdline, result) = run_qemu(&config, &settings, &SysfsHost::default(), &root)?;
            if let Some(path) = &cli.report {
                if let Err(e) = write_report(path, &cmdline, &result) {
                    tracing::warn!("Failed to write run report: {e:#}");
                }
            }
            Ok(result.process_exit_code())
        }
        Machine::Other(name) => Err(LaunchError::UnsupportedMachine(name.clone()).into()),
    }
}

/// Boot the guest under QEMU and wait for it to exit.
pub fn run_qemu(
    config: &LaunchConfig,
    settings: &Settings,
    host: &impl HostTopology,
    root: &Path,
) -> Result<(CommandLine, ExitResult)> {
    tracing::info!("Starting QEMU");

    let plan = TopologyPlan::plan(config, host)?;
    let cmdline = QemuBuilder::new(&settings.qemu, config, &plan).build();
    if config.verbose {
        tracing::info!("{cmdline}");
    }

    let guest = supervisor::spawn(&cmdline, root)?;

    if config.enable_affinity {
        let pinner = AffinityPinner::new(&settings.affinity, host, root);
        if let Err(e) = pinner.pin(guest.pid(), config.core_count) {
            tracing::warn!("QEMU affinity pinning failed: {e:#}");
        }
    }

    let result = ExitResult::decode(guest.wait()?);
    println!("{}", result.category);

    if !result.category.is_success() {
        tracing::info!("Invocation was: {cmdline}");
    }

    Ok((cmdline, result))
}

#[derive(Serialize)]
struct RunReport<'a> {
    command: Vec<String>,
    exit: &'a ExitResult,
    description: String,
}

fn write_report(path: &Path, cmdline: &CommandLine, result: &ExitResult) -> Result<()> {
    let report = RunReport {
        command: cmdline.tokens(),
        exit: result,
        description: result.category.to_string(),
    };
    let json = serde_json::to_string_pretty(&report)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
