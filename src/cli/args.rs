use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the config file
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    /// Enable debug output
    #[arg(short, long, global = true, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message to Claude within a conversation
    Chat {
        /// Your message; prompted for when omitted
        #[arg()]
        message: Vec<String>,

        /// Conversation to continue (defaults to the most recent one)
        #[arg(long)]
        id: Option<i64>,

        /// Wait for the complete response instead of streaming it
        #[arg(long)]
        no_stream: bool,

        /// Offer to show the conversation so far when prompting for a message
        #[arg(short = 'H', long, action = ArgAction::Set, default_value_t = true)]
        history: bool,
    },
    /// Create a new conversation
    Create {
        /// Title for the conversation
        #[arg(short, long)]
        title: Option<String>,
    },
    /// List conversations, or the messages of one conversation
    List {
        /// Show the messages of this conversation
        #[arg(long)]
        id: Option<i64>,
    },
    /// Delete conversations or messages
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },
    /// Manage the config file
    Configure {
        /// Reset the config file to the default values
        #[arg(long)]
        defaults: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeleteTarget {
    /// Delete a conversation and all of its messages
    Conversation {
        #[arg(long)]
        id: i64,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete messages by id
    Messages {
        /// Ids and inclusive ranges, e.g. "1-3, 5, 7"
        #[arg(long)]
        ids: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
