//! The evalsched command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use evalsched::commands;
use evalsched::config;
use git_testament::git_testament;
use git_testament::render_testament;
use tracing_log::AsTrace;

git_testament!(TESTAMENT);

/// The subcommands of `evalsched`.
#[derive(Subcommand)]
enum Commands {
    /// Schedules evaluations as a Slurm array job.
    Schedule(commands::schedule::Args),

    /// Displays evalsched configuration.
    Config(commands::config::Args),

    /// Generates shell completions.
    Completions(commands::completions::Args),
}

/// Schedules language model evaluations on Slurm.
#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use.
    #[arg(long, short, global = true, env = config::CONFIG_ENV_VAR, value_name = "PATH")]
    config: Option<PathBuf>,

    /// The verbosity flags.
    #[command(flatten)]
    verbose: Verbosity,
}

/// Runs the command line tool.
pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let load = || -> anyhow::Result<_> {
        let loaded = config::load(cli.config.as_deref())?;
        config::apply_cluster(loaded, config::host_name().as_deref())
    };

    match cli.command {
        Commands::Schedule(args) => commands::schedule::schedule(args, load()?).await,
        Commands::Config(args) => commands::config::config(args, load),
        Commands::Completions(args) => {
            commands::completions::completions(args, &mut Cli::command())
        }
    }
}

/// The entry point for `evalsched`.
#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
