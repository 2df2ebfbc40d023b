pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "Relay image-board threads and subreddits into chat feeds", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/tributary/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the delivery service until interrupted
    Run,
    /// Subscribe a feed to a thread, catalog search or subreddit
    Subscribe {
        /// Feed id or alias (e.g. @channel)
        #[arg(allow_negative_numbers = true)]
        feed: String,
        /// Reference understood by one of the vendors
        reference: String,
        /// Vendor options as key=value
        #[arg(short, long = "option")]
        options: Vec<String>,
    },
    /// List the subscriptions of a feed
    List {
        /// Feed id or alias
        #[arg(allow_negative_numbers = true)]
        feed: String,
        /// Show suspended subscriptions instead of active ones
        #[arg(long)]
        suspended: bool,
    },
    /// Suspend a subscription
    Suspend {
        #[command(flatten)]
        target: Target,
        /// Reason shown to feed admins
        #[arg(default_value = "suspended by operator")]
        reason: String,
    },
    /// Resume a suspended subscription
    Resume {
        #[command(flatten)]
        target: Target,
    },
    /// Delete a subscription
    Delete {
        #[command(flatten)]
        target: Target,
    },
    /// Delete suspended subscriptions whose error matches a LIKE pattern
    Clear {
        /// Feed id or alias
        #[arg(allow_negative_numbers = true)]
        feed: String,
        /// Pattern such as "%gone%"
        pattern: String,
    },
}

/// Identifies one subscription.
#[derive(clap::Args)]
pub struct Target {
    /// Feed id or alias
    #[arg(allow_negative_numbers = true)]
    pub feed: String,
    /// Vendor id (e.g. 4chan, reddit)
    pub vendor: String,
    /// Vendor-local subscription id
    pub sub_id: String,
}
