use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "storycast")]
#[command(version)]
#[command(about = "Real-time sync layer for interactive live-drama rooms")]
pub struct Args {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "storycast.toml")]
    pub config: PathBuf,

    /// Relay WebSocket URL (overrides [server] url)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Verbose diagnostics (debug level)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the room relay server
    Relay {
        /// Address to listen on (overrides [relay] bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Join a room as the streamer and drive a story
    Streamer {
        #[arg(long)]
        room: String,
        /// Story reference resolved by the story provider
        #[arg(long)]
        story: String,
    },
    /// Join a room as a viewer
    Viewer {
        #[arg(long)]
        room: String,
        #[arg(long, default_value = "viewer")]
        name: String,
    },
    /// Print shell completions to stdout
    Completions { shell: Shell },
}

impl Args {
    /// Fold command-line overrides into a loaded config.
    pub fn apply_to(&self, config: &mut SyncConfig) {
        if let Some(url) = &self.server {
            config.server.url = url.clone();
        }
        if let Command::Relay { bind: Some(bind) } = &self.command {
            config.relay.bind = bind.clone();
        }
    }

    /// `RUST_LOG`-style default directive for the subscriber.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "storycast=debug"
        } else {
            "storycast=info"
        }
    }
}
