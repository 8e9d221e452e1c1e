/// Command Dispatch Policy
/// Decides how an outgoing command reaches the PTY. A full-screen agent gets a
/// bracketed paste plus a separately delayed carriage return; a plain shell gets
/// the line as typed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BRACKET_PASTE_START: &str = "\x1b[200~";
pub const BRACKET_PASTE_END: &str = "\x1b[201~";
pub const SUBMIT: &[u8] = b"\r";

/// What to write for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Write `payload` as is
    Direct { payload: Vec<u8> },
    /// Write the wrapped `payload`, then a lone carriage return once `submit_after` elapsed
    BracketPaste { payload: Vec<u8>, submit_after: Duration },
}

impl DispatchPlan {
    pub fn payload(&self) -> &[u8] {
        match self {
            DispatchPlan::Direct { payload } | DispatchPlan::BracketPaste { payload, .. } => payload,
        }
    }
}

pub fn plan(text: &str, add_newline: bool, agent_running: bool, submit_delay: Duration) -> DispatchPlan {
    if agent_running {
        let mut payload = String::with_capacity(text.len() + BRACKET_PASTE_START.len() + BRACKET_PASTE_END.len());
        payload.push_str(BRACKET_PASTE_START);
        payload.push_str(text);
        payload.push_str(BRACKET_PASTE_END);
        return DispatchPlan::BracketPaste {
            payload: payload.into_bytes(),
            submit_after: submit_delay,
        };
    }

    let mut payload = text.as_bytes().to_vec();
    if add_newline {
        payload.extend_from_slice(SUBMIT);
    }
    DispatchPlan::Direct { payload }
}

/// Whether `text` starts the target agent: it begins with one of `prefixes`
/// as a whole word (`claude`, `claude --continue`, but not `claudette`)
pub fn is_agent_launch(text: &str, prefixes: &[String]) -> bool {
    let trimmed = text.trim_start();
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim();
        !prefix.is_empty()
            && trimmed.starts_with(prefix)
            && trimmed[prefix.len()..]
                .chars()
                .next()
                .map_or(true, char::is_whitespace)
    })
}

/// Named one-click commands offered by the sidebar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Shortcut {
    StartAgent,
    ContinueAgent,
    ResumeAgent,
    ClearContext,
    Compact,
    Interrupt,
    Exit,
}

impl Shortcut {
    pub fn text(self) -> &'static str {
        match self {
            Shortcut::StartAgent => "claude",
            Shortcut::ContinueAgent => "claude --continue",
            Shortcut::ResumeAgent => "claude --resume",
            Shortcut::ClearContext => "/clear",
            Shortcut::Compact => "/compact",
            Shortcut::Interrupt => "\x1b",
            Shortcut::Exit => "/exit",
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            Shortcut::StartAgent | Shortcut::ContinueAgent | Shortcut::ResumeAgent => "launch",
            Shortcut::ClearContext | Shortcut::Compact | Shortcut::Exit => "agent-command",
            Shortcut::Interrupt => "control",
        }
    }

    /// Raw keystrokes bypass the dispatch policy entirely
    pub fn is_raw(self) -> bool {
        matches!(self, Shortcut::Interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(100);

    #[test]
    fn idle_shell_gets_plain_line() {
        assert_eq!(
            plan("ls -la", true, false, DELAY),
            DispatchPlan::Direct {
                payload: b"ls -la\r".to_vec()
            }
        );
        assert_eq!(plan("ls", false, false, DELAY).payload(), b"ls");
    }

    #[test]
    fn running_agent_gets_bracket_paste() {
        let plan = plan("fix the tests\nplease", true, true, DELAY);
        assert_eq!(
            plan,
            DispatchPlan::BracketPaste {
                payload: b"\x1b[200~fix the tests\nplease\x1b[201~".to_vec(),
                submit_after: DELAY,
            }
        );
    }

    #[test]
    fn launch_detection_is_word_prefix() {
        let prefixes = vec!["claude".to_string()];
        assert!(is_agent_launch("claude", &prefixes));
        assert!(is_agent_launch("  claude --continue", &prefixes));
        assert!(!is_agent_launch("claudette", &prefixes));
        assert!(!is_agent_launch("echo claude", &prefixes));
        assert!(!is_agent_launch("claude", &[String::new()]));
    }

    #[test]
    fn launch_shortcuts_are_launch_commands() {
        let prefixes = vec!["claude".to_string()];
        for shortcut in [Shortcut::StartAgent, Shortcut::ContinueAgent, Shortcut::ResumeAgent] {
            assert!(is_agent_launch(shortcut.text(), &prefixes));
        }
        assert!(!is_agent_launch(Shortcut::ClearContext.text(), &prefixes));
        assert!(Shortcut::Interrupt.is_raw());
    }
}
