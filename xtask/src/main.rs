use clap::Parser;
use std::process::ExitCode;

mod app;
mod build;
mod cli;
mod config;
mod error;
mod logging;
mod qemu;
mod util;
mod vm;

fn main() -> ExitCode {
    let cli = crate::cli::Cli::parse();
    crate::logging::init(cli.verbose);

    match crate::app::run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            if cli.verbose {
                eprintln!("error: {err:?}");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::from(crate::error::exit_code_for(&err))
        }
    }
}
