//! CLI surface.
//!
//! Exit codes: 0 success, 1 generic failure, 2 misuse (clap's default for
//! bad arguments).

pub mod doctor;
pub mod pid;
pub mod profile;

use clap::{Parser, Subcommand};

/// clawdbot — local-first control plane for a personal AI assistant.
#[derive(Debug, Parser)]
#[command(name = "clawdbot", version, about)]
pub struct Cli {
    /// Config profile name (isolates state dir and config file).
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Development mode: verbose logging, no profile rewriting.
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// First-run setup: state dir, gateway token, initial config.
    Onboard,
    /// Gateway process control.
    #[command(subcommand)]
    Gateway(GatewayCommand),
    /// Run one agent turn from the terminal and print the reply.
    Agent {
        /// The message to send.
        message: String,
        /// Session key (defaults to the main session).
        #[arg(long)]
        session: Option<String>,
        /// Model override (`provider/model`).
        #[arg(long)]
        model: Option<String>,
    },
    /// Send a message out on a channel.
    Send {
        /// Channel id (`discord`, `telegram`, …).
        #[arg(long)]
        channel: String,
        /// Recipient (`user:<id>`, `channel:<id>`, or channel-native id).
        #[arg(long)]
        to: String,
        /// Message text.
        message: String,
    },
    /// Pairing-code management for DM channels.
    #[command(subcommand)]
    Pairing(PairingCommand),
    /// Diagnose state dir, stores, config, and credentials.
    Doctor,
    /// Workflow hook commands.
    #[command(subcommand)]
    Hooks(HooksCommand),
    /// Model catalogue operations.
    #[command(subcommand)]
    Models(ModelsCommand),
    /// Skill pack management.
    #[command(subcommand)]
    Skills(SkillsCommand),
}

#[derive(Debug, Subcommand)]
pub enum SkillsCommand {
    /// Install a skill pack from a .tgz archive into `tools/<name>/`.
    Install {
        /// Path to the skill archive.
        archive: std::path::PathBuf,
        /// Skill name (directory under the state dir's `tools/`).
        #[arg(long)]
        name: String,
        /// Leading path components to strip from archive entries.
        #[arg(long, default_value_t = 1)]
        strip_components: usize,
    },
    /// List installed skill packs.
    List,
}

#[derive(Debug, Subcommand)]
pub enum GatewayCommand {
    /// Start the gateway in the foreground.
    Start,
    /// Stop a running gateway via its pid file.
    Stop,
    /// Stop then start.
    Restart,
}

#[derive(Debug, Subcommand)]
pub enum PairingCommand {
    /// List pending pairing codes.
    List {
        /// Restrict to one channel.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Approve a pairing code and allowlist its sender.
    Approve {
        code: String,
        /// Channel the code belongs to.
        #[arg(long)]
        provider: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum HooksCommand {
    /// Gmail hook management.
    #[command(subcommand)]
    Gmail(GmailCommand),
}

#[derive(Debug, Subcommand)]
pub enum GmailCommand {
    /// Configure the Gmail hook account.
    Setup {
        #[arg(long)]
        account: String,
    },
    /// Run the Gmail hook once.
    Run,
}

#[derive(Debug, Subcommand)]
pub enum ModelsCommand {
    /// List registered models.
    List,
    /// Probe configured providers for available models.
    Scan,
    /// Set the primary model.
    Set {
        /// `provider/model` ref.
        model: String,
    },
}
