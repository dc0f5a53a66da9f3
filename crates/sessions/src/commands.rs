//! Directive command extraction.
//!
//! Messages beginning with a known slash command mutate session state (or
//! report it) instead of starting an agent turn. In groups, only the
//! owner may issue them.

use oc_domain::levels::{ElevatedLevel, GroupActivation, ThinkingLevel, VerboseLevel};

/// A parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Think(ThinkingLevel),
    Verbose(VerboseLevel),
    Elevated(ElevatedLevel),
    /// `/model <provider/model>`; `None` clears the override.
    Model(Option<String>),
    Reset,
    Compact,
    Activation(GroupActivation),
    Status,
    WhoAmI,
    Commands,
}

/// Parse a leading directive out of `body`. Returns the directive and the
/// remaining text (for `/model x rest` forms the remainder is discarded —
/// directives own the whole message).
pub fn extract_directive(body: &str) -> Option<Directive> {
    let trimmed = body.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let head = parts.next()?;
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match head {
        "/think" => {
            let level = arg.and_then(ThinkingLevel::parse)?;
            Some(Directive::Think(level))
        }
        "/verbose" => match arg {
            Some("off") => Some(Directive::Verbose(VerboseLevel::Off)),
            Some("on") | None => Some(Directive::Verbose(VerboseLevel::On)),
            _ => None,
        },
        "/elevated" => match arg {
            Some("off") => Some(Directive::Elevated(ElevatedLevel::Off)),
            Some("ask") => Some(Directive::Elevated(ElevatedLevel::Ask)),
            Some("on") | None => Some(Directive::Elevated(ElevatedLevel::On)),
            _ => None,
        },
        "/model" => Some(Directive::Model(arg.map(str::to_owned))),
        "/reset" => Some(Directive::Reset),
        "/compact" => Some(Directive::Compact),
        "/activation" => match arg {
            Some("mention") => Some(Directive::Activation(GroupActivation::Mention)),
            Some("always") => Some(Directive::Activation(GroupActivation::Always)),
            _ => None,
        },
        "/status" => Some(Directive::Status),
        "/whoami" => Some(Directive::WhoAmI),
        "/commands" => Some(Directive::Commands),
        _ => None,
    }
}

/// One-line help for `/commands`.
pub fn commands_help() -> &'static str {
    "/think <off|minimal|low|medium|high> · /verbose [on|off] · \
     /elevated [on|ask|off] · /model [provider/model] · /reset · /compact · \
     /activation <mention|always> · /status · /whoami · /commands"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_levels() {
        assert_eq!(
            extract_directive("/think high"),
            Some(Directive::Think(ThinkingLevel::High))
        );
        assert_eq!(extract_directive("/think bogus"), None);
        assert_eq!(extract_directive("/think"), None);
    }

    #[test]
    fn model_with_and_without_arg() {
        assert_eq!(
            extract_directive("/model anthropic/claude-sonnet-4"),
            Some(Directive::Model(Some("anthropic/claude-sonnet-4".into())))
        );
        assert_eq!(extract_directive("/model"), Some(Directive::Model(None)));
    }

    #[test]
    fn bare_toggles_default_on() {
        assert_eq!(
            extract_directive("/verbose"),
            Some(Directive::Verbose(VerboseLevel::On))
        );
        assert_eq!(
            extract_directive("/elevated"),
            Some(Directive::Elevated(ElevatedLevel::On))
        );
    }

    #[test]
    fn plain_text_is_not_a_directive() {
        assert_eq!(extract_directive("hello /think"), None);
        assert_eq!(extract_directive("what is /status?"), None);
        assert_eq!(extract_directive("/unknown"), None);
    }

    #[test]
    fn whitespace_tolerated() {
        assert_eq!(
            extract_directive("  /reset  "),
            Some(Directive::Reset)
        );
        assert_eq!(
            extract_directive("/activation   always"),
            Some(Directive::Activation(GroupActivation::Always))
        );
    }
}
