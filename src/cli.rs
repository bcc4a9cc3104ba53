//! Command-line surface: argument parsing only, no I/O side effects beyond
//! constructing the parsed tree. `main.rs` owns dispatch.

use clap::{Parser, Subcommand};

use crate::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "bo", version, about = "Directory sync and remote command runner")]
pub struct Cli {
    /// Repeat for more verbose logging (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the workdir -> server / command-alias mapping.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Rescan the current workdir and push the result to a configured server.
    Sync {
        /// Which configured server to sync to; defaults to the only one.
        server: Option<String>,
    },
    /// Run a one-off remote command without a configured alias.
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },
    /// Listen for incoming sync and command connections.
    Server {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Anything else is looked up as a user-defined command alias.
    #[command(external_subcommand)]
    Alias(Vec<String>),
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Register the current directory as a workdir pointed at a server.
    Init {
        host: String,
        port: u16,
        target_dir: String,
    },
    /// Forget the current directory's workdir configuration.
    Deinit,
    /// Store a named command alias for the current workdir.
    Command { name: String, argv: Vec<String> },
    /// Remove a previously stored command alias.
    RemoveCommand { name: String },
    /// List configured workdirs and their servers/aliases.
    Ls,
    /// Print the path to the config file.
    Path,
}

#[derive(Subcommand, Debug)]
pub enum RemoteAction {
    /// Run an arbitrary command on the configured server.
    Run { argv: Vec<String> },
}
