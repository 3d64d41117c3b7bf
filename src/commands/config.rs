//! Implementation of the `config` subcommand.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use evalsched_engine::Config;

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The `config` subcommand to run.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Prints the default configuration.
    Init,

    /// Prints the configuration in effect on this host, with the matching
    /// cluster profile applied.
    Resolve,
}

/// Runs the `config` command.
///
/// The configuration is only loaded for `resolve`, so `init` works even when
/// no cluster profile matches this host.
pub fn config(args: Args, load: impl FnOnce() -> Result<Config>) -> Result<()> {
    let config = match args.command {
        ConfigSubcommand::Init => Config::default(),
        ConfigSubcommand::Resolve => load()?,
    };

    let text = toml::to_string_pretty(&config).context("failed to serialize configuration")?;
    print!("{text}");
    Ok(())
}
