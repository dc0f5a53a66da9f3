//! Dispatch-wrapper unwrapping.
//!
//! `env`, `nice`, `nohup`, `stdbuf`, and `timeout` merely re-dispatch the
//! real command and are stripped so analysis sees the true head.
//! `chrt`, `doas`, `ionice`, `setsid`, `sudo`, and `taskset` change
//! privileges or scheduling scope and are blocked outright. Unwrapping
//! aborts when a wrapper flag is ambiguous (we cannot tell where the
//! wrapped command starts) and is capped at depth 4.

/// Wrappers stripped before analysis.
const PASS_THROUGH: &[&str] = &["env", "nice", "nohup", "stdbuf", "timeout"];

/// Wrappers blocked outright — they gain privilege or escape scope.
const BLOCKED: &[&str] = &["chrt", "doas", "ionice", "setsid", "sudo", "taskset"];

/// Max unwrap depth.
const MAX_DEPTH: usize = 4;

/// Result of unwrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwrapOutcome {
    /// The remaining argv after stripping pass-through wrappers.
    Unwrapped(Vec<String>),
    /// A privilege-gaining wrapper was found.
    Blocked { wrapper: String },
    /// A wrapper flag made the real command boundary ambiguous.
    Ambiguous { wrapper: String, flag: String },
}

/// Strip dispatch wrappers from `argv` until the real head is visible.
pub fn unwrap_dispatch_wrappers(argv: &[String]) -> UnwrapOutcome {
    let mut rest: Vec<String> = argv.to_vec();

    for _ in 0..=MAX_DEPTH {
        let Some(head) = rest.first() else {
            return UnwrapOutcome::Unwrapped(rest);
        };
        let head_name = basename(head);

        if BLOCKED.contains(&head_name) {
            return UnwrapOutcome::Blocked {
                wrapper: head_name.to_owned(),
            };
        }
        if !PASS_THROUGH.contains(&head_name) {
            return UnwrapOutcome::Unwrapped(rest);
        }

        match strip_one_wrapper(head_name, &rest[1..]) {
            Ok(inner) => rest = inner,
            Err(flag) => {
                return UnwrapOutcome::Ambiguous {
                    wrapper: head_name.to_owned(),
                    flag,
                }
            }
        }
    }

    // Depth exhausted with wrappers still present: keep what we have and
    // let segment analysis judge the wrapper itself.
    UnwrapOutcome::Unwrapped(rest)
}

/// Skip one wrapper's own arguments, returning the wrapped command.
/// `Err(flag)` when a flag's value handling is ambiguous.
fn strip_one_wrapper(wrapper: &str, args: &[String]) -> Result<Vec<String>, String> {
    let mut i = 0;
    match wrapper {
        "nohup" => {}
        "env" => {
            while i < args.len() {
                let a = &args[i];
                if a == "-i" || a == "-0" || a == "--ignore-environment" {
                    i += 1;
                } else if a == "-u" || a == "--unset" || a == "-C" || a == "--chdir" {
                    // Flag takes a value in the next arg.
                    i += 2;
                } else if a.starts_with("--unset=") || a.starts_with("--chdir=") {
                    i += 1;
                } else if a == "-S" || a == "--split-string" || a.starts_with("-S") {
                    // -S re-tokenizes its argument; where the command starts
                    // depends on env's own parser. Refuse to guess.
                    return Err("-S".into());
                } else if a.starts_with('-') {
                    return Err(a.clone());
                } else if a.contains('=') {
                    // VAR=value assignment.
                    i += 1;
                } else {
                    break;
                }
            }
        }
        "nice" => {
            while i < args.len() {
                let a = &args[i];
                if a == "-n" || a == "--adjustment" {
                    i += 2;
                } else if a.starts_with("--adjustment=") || is_nice_numeric(a) {
                    i += 1;
                } else if a.starts_with('-') {
                    return Err(a.clone());
                } else {
                    break;
                }
            }
        }
        "stdbuf" => {
            while i < args.len() {
                let a = &args[i];
                if a == "-i" || a == "-o" || a == "-e" {
                    i += 2;
                } else if (a.starts_with("-i") || a.starts_with("-o") || a.starts_with("-e"))
                    && a.len() > 2
                {
                    i += 1;
                } else if a.starts_with("--input=")
                    || a.starts_with("--output=")
                    || a.starts_with("--error=")
                {
                    i += 1;
                } else if a.starts_with('-') {
                    return Err(a.clone());
                } else {
                    break;
                }
            }
        }
        "timeout" => {
            let mut saw_duration = false;
            while i < args.len() {
                let a = &args[i];
                if a == "-s" || a == "--signal" || a == "-k" || a == "--kill-after" {
                    i += 2;
                } else if a.starts_with("--signal=") || a.starts_with("--kill-after=") {
                    i += 1;
                } else if a == "--preserve-status" || a == "--foreground" || a == "-v" {
                    i += 1;
                } else if a.starts_with('-') {
                    return Err(a.clone());
                } else if !saw_duration {
                    // First positional is the duration.
                    saw_duration = true;
                    i += 1;
                } else {
                    break;
                }
            }
        }
        _ => {}
    }
    Ok(args[i..].to_vec())
}

fn is_nice_numeric(a: &str) -> bool {
    // nice accepts the legacy "-10" adjustment form.
    a.len() > 1
        && a.starts_with('-')
        && a[1..].chars().all(|c| c.is_ascii_digit())
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
