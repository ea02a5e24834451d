//! CLI surface for scribe.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config::Config;
use crate::daemon;
use crate::git::VersionedStore;
use crate::{Result, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "scribe",
    version,
    about = "Relay chat-channel messages into a git-versioned append-only log",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Config file (default: SCRIBE_CONFIG, else environment only).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare the working copy: clone-or-open, set identity and remote,
    /// and verify the remote is reachable.
    Init,

    /// Start the relay (reads events from stdin until EOF).
    Run,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    telemetry::init(cli.verbose);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => init(&config),
        Commands::Run => daemon::run_relay(&config),
    }
}

fn init(config: &Config) -> Result<()> {
    config.validate()?;
    let mut store = daemon::prepare_store(config)?;
    store.sync_before_write()?;
    tracing::info!(workdir = %config.workdir().display(), "working copy ready");
    Ok(())
}
