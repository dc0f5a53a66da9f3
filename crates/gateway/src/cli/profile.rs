//! Profile-aware command rewriting.
//!
//! When `CLAWDBOT_PROFILE` is set, `clawdbot …` invocations are rewritten
//! to carry `--profile <name>` so shells, cron lines, and copy-pasted
//! commands land in the active profile. The rewrite is skipped when the
//! user already passed `--profile` or `--dev`, and leaves non-clawdbot
//! argv untouched.

/// Rewrite an argv according to the active profile. Returns the argv to
/// execute.
pub fn apply_profile(argv: &[String], profile_env: Option<&str>) -> Vec<String> {
    let Some(profile) = profile_env.filter(|p| !p.is_empty()) else {
        return argv.to_vec();
    };
    let Some(program) = argv.first() else {
        return argv.to_vec();
    };
    let program_name = program.rsplit('/').next().unwrap_or(program);
    if program_name != "clawdbot" {
        return argv.to_vec();
    }
    if argv.iter().any(|a| a == "--profile" || a.starts_with("--profile=") || a == "--dev") {
        return argv.to_vec();
    }

    let mut rewritten = Vec::with_capacity(argv.len() + 2);
    rewritten.push(argv[0].clone());
    rewritten.push("--profile".to_owned());
    rewritten.push(profile.to_owned());
    rewritten.extend(argv[1..].iter().cloned());
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inserts_profile_after_binary() {
        let out = apply_profile(&argv(&["clawdbot", "gateway", "start"]), Some("work"));
        assert_eq!(out, argv(&["clawdbot", "--profile", "work", "gateway", "start"]));
    }

    #[test]
    fn explicit_profile_respected() {
        let original = argv(&["clawdbot", "--profile", "other", "doctor"]);
        assert_eq!(apply_profile(&original, Some("work")), original);

        let eq_form = argv(&["clawdbot", "--profile=other", "doctor"]);
        assert_eq!(apply_profile(&eq_form, Some("work")), eq_form);
    }

    #[test]
    fn dev_flag_suppresses_rewrite() {
        let original = argv(&["clawdbot", "--dev", "doctor"]);
        assert_eq!(apply_profile(&original, Some("work")), original);
    }

    #[test]
    fn non_clawdbot_commands_untouched() {
        let original = argv(&["grep", "--profile", "x"]);
        assert_eq!(apply_profile(&original, Some("work")), original);
    }

    #[test]
    fn no_env_no_rewrite() {
        let original = argv(&["clawdbot", "doctor"]);
        assert_eq!(apply_profile(&original, None), original);
        assert_eq!(apply_profile(&original, Some("")), original);
    }

    #[test]
    fn path_qualified_binary_recognized() {
        let out = apply_profile(&argv(&["/usr/local/bin/clawdbot", "doctor"]), Some("work"));
        assert_eq!(out[1], "--profile");
        assert_eq!(out[2], "work");
    }
}
