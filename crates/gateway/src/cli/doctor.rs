//! `clawdbot doctor` — state and configuration diagnostics.

use std::path::Path;

use oc_domain::config::{Config, ConfigSeverity};

/// One diagnostic line.
#[derive(Debug)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Run every check. Returns `false` when any check failed.
pub fn run(config: &Config, state_dir: &Path) -> (Vec<Check>, bool) {
    let mut checks = Vec::new();

    checks.push(check_state_dir(state_dir));
    checks.extend(check_quarantines(state_dir));
    checks.extend(check_config(config));
    checks.push(check_auth(state_dir));

    let passed = checks.iter().all(|c| c.ok);
    (checks, passed)
}

fn check_state_dir(state_dir: &Path) -> Check {
    let ok = state_dir.is_dir();
    Check {
        name: "state-dir".into(),
        ok,
        detail: if ok {
            format!("{}", state_dir.display())
        } else {
            format!("{} missing or not a directory", state_dir.display())
        },
    }
}

/// Quarantined store files mean a malformed store was rebuilt empty.
fn check_quarantines(state_dir: &Path) -> Vec<Check> {
    let mut checks = Vec::new();
    for sub in ["", "sessions", "cron", "allowlist"] {
        let dir = if sub.is_empty() {
            state_dir.to_path_buf()
        } else {
            state_dir.join(sub)
        };
        for quarantined in oc_store::list_quarantined(&dir) {
            checks.push(Check {
                name: "store-integrity".into(),
                ok: false,
                detail: format!(
                    "quarantined store file: {} (data was reset; inspect or delete)",
                    quarantined.display()
                ),
            });
        }
    }
    if checks.is_empty() {
        checks.push(Check {
            name: "store-integrity".into(),
            ok: true,
            detail: "no quarantined store files".into(),
        });
    }
    checks
}

fn check_config(config: &Config) -> Vec<Check> {
    let issues = config.validate();
    if issues.is_empty() {
        return vec![Check {
            name: "config".into(),
            ok: true,
            detail: "no issues".into(),
        }];
    }
    issues
        .into_iter()
        .map(|issue| Check {
            name: format!("config:{}", issue.field),
            ok: issue.severity != ConfigSeverity::Error,
            detail: issue.message,
        })
        .collect()
}

fn check_auth(state_dir: &Path) -> Check {
    let path = state_dir.join("auth.json");
    if !path.exists() {
        return Check {
            name: "auth".into(),
            ok: false,
            detail: "auth.json missing — run `clawdbot onboard` or add a profile".into(),
        };
    }
    Check {
        name: "auth".into(),
        ok: true,
        detail: "auth.json present".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_surfaces_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth.json"), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("sessions")).unwrap();
        std::fs::write(
            dir.path().join("sessions/main.json.corrupt.123"),
            "{broken",
        )
        .unwrap();

        let (checks, passed) = run(&Config::default(), dir.path());
        assert!(!passed);
        assert!(checks
            .iter()
            .any(|c| c.name == "store-integrity" && !c.ok && c.detail.contains("corrupt")));
    }

    #[test]
    fn clean_state_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth.json"), "{}").unwrap();
        let (_, passed) = run(&Config::default(), dir.path());
        assert!(passed);
    }
}
