//! Policy decision for one command.

use serde::Serialize;

use oc_domain::config::{ExecAsk, ExecSecurity};

use crate::allowlist::{pattern_matches, ApprovalDecision};
use crate::shell::{extract_inline_command, shell_family, split_segments, tokenize, ShellFamily};
use crate::wrappers::{basename, unwrap_dispatch_wrappers, UnwrapOutcome};
use crate::CommandSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the decision needs besides the command itself.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    /// Allowlist patterns for the agent.
    pub allowlist: Vec<String>,
    /// Binaries trusted without an allowlist entry.
    pub safe_bins: Vec<String>,
    /// Binaries installed by skills, trusted within their skill root.
    pub skill_bins: Vec<String>,
    /// A standing human decision for this command, if one was recorded.
    pub approval: Option<ApprovalDecision>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The engine's verdict on one command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecDecision {
    pub allowed: bool,
    pub requires_ask: bool,
    pub allowlist_satisfied: bool,
    /// False when wrapper unwrapping aborted (blocked or ambiguous).
    pub analysis_ok: bool,
    pub shell_wrapper_blocked: bool,
    pub windows_shell_wrapper_blocked: bool,
    /// Reason tag carried on `exec.denied` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate one command against the policy context.
pub fn evaluate(spec: &CommandSpec, ctx: &PolicyContext) -> ExecDecision {
    let mut decision = ExecDecision::default();

    if ctx.security == ExecSecurity::Deny {
        decision.event_reason = Some("security-deny".into());
        decision.error_message = Some("shell execution is disabled".into());
        return decision;
    }

    // Normalize to argv, unwrapping dispatch wrappers first.
    let argv: Vec<String> = match spec {
        CommandSpec::Argv(argv) => argv.clone(),
        CommandSpec::Shell(s) => tokenize(s),
    };
    if argv.is_empty() {
        decision.event_reason = Some("empty-command".into());
        decision.error_message = Some("empty command".into());
        return decision;
    }

    let unwrapped = match unwrap_dispatch_wrappers(&argv) {
        UnwrapOutcome::Unwrapped(rest) => rest,
        UnwrapOutcome::Blocked { wrapper } => {
            decision.event_reason = Some("allowlist-miss".into());
            decision.error_message =
                Some(format!("'{wrapper}' gains privilege and is blocked"));
            return decision;
        }
        UnwrapOutcome::Ambiguous { wrapper, flag } => {
            decision.event_reason = Some("allowlist-miss".into());
            decision.error_message = Some(format!(
                "cannot analyze '{wrapper} {flag}': wrapped command boundary is ambiguous"
            ));
            return decision;
        }
    };
    let Some(head) = unwrapped.first() else {
        decision.event_reason = Some("empty-command".into());
        decision.error_message = Some("wrapper with no command".into());
        return decision;
    };

    // Shell wrappers require explicit approval: the inline string can do
    // anything the shell can.
    let (segments, shell_blocked) = match shell_family(head) {
        Some(family) => {
            match family {
                ShellFamily::Posix => decision.shell_wrapper_blocked = true,
                ShellFamily::Cmd | ShellFamily::PowerShell => {
                    decision.windows_shell_wrapper_blocked = true
                }
            }
            let inline = extract_inline_command(family, &unwrapped[1..]);
            let segments = inline
                .as_deref()
                .map(split_segments)
                .unwrap_or_default();
            (segments, true)
        }
        None => match spec {
            // An inline shell string segments on control operators; a raw
            // argv is a single segment.
            CommandSpec::Shell(s) => (split_segments(s), false),
            CommandSpec::Argv(_) => (vec![unwrapped.join(" ")], false),
        },
    };

    decision.analysis_ok = true;
    decision.allowlist_satisfied =
        !segments.is_empty() && segments.iter().all(|seg| segment_allowed(seg, ctx));

    if ctx.security == ExecSecurity::Full && !shell_blocked {
        if ctx.ask == ExecAsk::Always && ctx.approval.is_none() {
            decision.requires_ask = true;
            decision.event_reason = Some("approval-required".into());
            return decision;
        }
        decision.allowed = true;
        return decision;
    }

    if ctx.ask == ExecAsk::Always {
        decision.requires_ask = true;
    }

    if decision.analysis_ok && decision.allowlist_satisfied && !shell_blocked {
        if decision.requires_ask && ctx.approval.is_none() {
            decision.event_reason = Some("approval-required".into());
            return decision;
        }
        decision.allowed = true;
        return decision;
    }

    // Allowlist miss or blocked shell wrapper: a standing human decision
    // still lets the command through.
    match ctx.approval {
        Some(ApprovalDecision::AllowOnce) | Some(ApprovalDecision::AllowAlways) => {
            decision.allowed = true;
            decision
        }
        None => {
            decision.event_reason = Some("allowlist-miss".into());
            decision.error_message = Some(format_allowlist_miss_message(&decision));
            if ctx.ask == ExecAsk::OnMiss || ctx.ask == ExecAsk::Always {
                decision.requires_ask = true;
            }
            decision
        }
    }
}

/// Whether one segment's head is trusted.
fn segment_allowed(segment: &str, ctx: &PolicyContext) -> bool {
    let tokens = tokenize(segment);
    let Some(head) = tokens.first() else {
        return false;
    };
    let head_name = basename(head);

    if ctx.safe_bins.iter().any(|b| b == head_name)
        || ctx.skill_bins.iter().any(|b| b == head_name)
    {
        return true;
    }
    ctx.allowlist
        .iter()
        .any(|pattern| pattern_matches(pattern, segment))
}

/// Human-facing denial message. Names the wrapper family when a shell
/// wrapper caused the miss so the operator knows what to approve.
pub fn format_allowlist_miss_message(decision: &ExecDecision) -> String {
    let mut msg = String::from("Command not in allowlist.");
    if decision.shell_wrapper_blocked {
        msg.push_str(" Shell wrappers (sh/bash/zsh -c) require explicit approval.");
    }
    if decision.windows_shell_wrapper_blocked {
        msg.push_str(" Windows shell wrappers (cmd.exe /c, powershell -Command) require explicit approval.");
    }
    msg.push_str(" Approve it once, or add an allowlist entry.");
    msg
}
