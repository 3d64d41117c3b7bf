//! Implementation of the `completions` subcommand.

use std::io;

use anyhow::Result;
use clap::Command;
use clap::Parser;
use clap_complete::Shell;
use clap_complete::generate;

/// Arguments for the `completions` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The shell to generate completions for.
    #[arg(value_enum)]
    shell: Shell,
}

/// The main function for the `completions` subcommand.
pub fn completions(args: Args, cmd: &mut Command) -> Result<()> {
    let name = cmd.get_name().to_string();
    generate(args.shell, cmd, name, &mut io::stdout());
    Ok(())
}
