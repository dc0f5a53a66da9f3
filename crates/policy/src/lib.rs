//! Shell-execution policy engine.
//!
//! A command arrives either as an `argv` vector or an inline shell string.
//! The engine unwraps dispatch wrappers, detects shell wrappers, splits the
//! command into segments, and checks every segment head against the
//! allowlist and safe-bin profiles before deciding allow / ask / deny.
//! Node `system.run` requests pass through the same path as local shell
//! commands.

pub mod allowlist;
pub mod decision;
pub mod shell;
pub mod wrappers;

pub use allowlist::{AllowlistEntry, AllowlistStore, ApprovalDecision};
pub use decision::{evaluate, format_allowlist_miss_message, ExecDecision, PolicyContext};
pub use shell::{extract_inline_command, shell_family, split_segments, ShellFamily};
pub use wrappers::{unwrap_dispatch_wrappers, UnwrapOutcome};

/// A command submitted for policy evaluation.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    /// Pre-tokenized argv; no shell interpretation happens.
    Argv(Vec<String>),
    /// An inline shell string, to be segmented on `; && || |`.
    Shell(String),
}

impl CommandSpec {
    pub fn display(&self) -> String {
        match self {
            CommandSpec::Argv(argv) => argv.join(" "),
            CommandSpec::Shell(s) => s.clone(),
        }
    }
}
