/// Output Classifier
/// Cleans raw PTY output and decides whether it is cosmetic redraw noise or real
/// agent activity. Also recognises the agent's startup banners and the return
/// of a shell prompt straight from the output stream, which reacts faster than
/// the process-table poll.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;

/// How many non-empty lines the shell-prompt fallback looks back over
pub const PROMPT_SCAN_LINES: usize = 10;

static CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("valid CSI pattern"));
static OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("valid OSC pattern"));
// C0 controls minus \n and \r
static C0: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x09\x0b\x0c\x0e-\x1f\x7f]").expect("valid C0 pattern"));

// Residue like `[?25h` or `1;1H` left when a sequence was split across reads
static DEBRIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[[?=>]?[0-9;]*[A-Za-z~]?|[0-9]*;[0-9;]*[A-Za-z~]?)$").expect("valid debris pattern")
});
static PROGRESS_BAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[=#>\-. ]*\]\s*(?:\d{1,3}%)?$").expect("valid progress pattern")
});
static SHELL_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.-]+@[\w.-]+(?::\S*)?.*[$#%>]\s*$").expect("valid prompt pattern")
});

const PROMPT_GLYPHS: &[&str] = &[">", "$", "#", "%", "❯", "›", "➜"];

/// Known startup banners and prompts of the Claude Code CLI (lowercase)
const STARTUP_BANNERS: &[&str] = &[
    "welcome to claude",
    "claude code v",
    "? for shortcuts",
    "/help for help",
    "esc to interrupt",
];

/// Remove CSI sequences, then OSC sequences, then C0 controls (keeping CR/LF).
/// Meant to run exactly once per raw chunk.
pub fn strip_control_sequences(raw: &str) -> String {
    let without_csi = CSI.replace_all(raw, "");
    let without_osc = OSC.replace_all(&without_csi, "");
    C0.replace_all(&without_osc, "").into_owned()
}

/// True when cleaned output carries nothing but redraw debris
pub fn is_noise(clean: &str) -> bool {
    clean
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(is_noise_line)
}

fn is_noise_line(line: &str) -> bool {
    if PROMPT_GLYPHS.contains(&line) {
        return true;
    }
    if line.chars().all(|c| c.is_whitespace() || is_glyph(c)) {
        return true;
    }
    DEBRIS.is_match(line) || PROGRESS_BAR.is_match(line)
}

// Box drawing, block elements and braille spinner frames
fn is_glyph(c: char) -> bool {
    matches!(c, '\u{2500}'..='\u{259F}' | '\u{2800}'..='\u{28FF}')
}

/// Name of a process given its full command string: basename of the first token
pub fn process_name(command: &str) -> &str {
    let first = command.split_whitespace().next().unwrap_or("");
    first.rsplit(['/', '\\']).next().unwrap_or(first)
}

/// Case-insensitive containment of the agent signature
pub fn matches_signature(text: &str, signature: &str) -> bool {
    !signature.is_empty() && text.to_lowercase().contains(&signature.to_lowercase())
}

/// Outcome of the output-stream fallback detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternVerdict {
    /// A startup banner appeared while the agent was not known to be running
    AgentStarted,
    /// A shell prompt reappeared while the agent was believed running
    ShellReturned,
}

/// Rolling window of the last non-empty cleaned lines of one tab.
/// The trailing unterminated line is kept separately because a waiting
/// prompt never ends in a newline.
#[derive(Debug, Default)]
pub struct LineTail {
    lines: VecDeque<String>,
    partial: String,
}

impl LineTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, clean: &str) {
        self.partial.push_str(clean);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = visible_segment(&line);
            if !line.is_empty() {
                self.lines.push_back(line.to_string());
                if self.lines.len() > PROMPT_SCAN_LINES {
                    self.lines.pop_front();
                }
            }
        }
    }

    /// Last non-empty lines, oldest first, including the pending partial line
    pub fn recent(&self) -> impl Iterator<Item = &str> {
        let partial = visible_segment(&self.partial);
        let partial = (!partial.is_empty()).then_some(partial);
        let skip = (self.lines.len() + usize::from(partial.is_some())).saturating_sub(PROMPT_SCAN_LINES);
        self.lines
            .iter()
            .map(String::as_str)
            .chain(partial)
            .skip(skip)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

// What a carriage return leaves visible: the text after the last CR
fn visible_segment(line: &str) -> &str {
    let line = line.trim_end_matches(['\n', '\r']);
    line.rsplit('\r').next().unwrap_or(line).trim()
}

/// Banner / prompt matcher for the target agent
#[derive(Debug, Clone)]
pub struct PatternDetector {
    banners: Vec<String>,
}

impl PatternDetector {
    pub fn new(signature: &str) -> Self {
        let mut banners: Vec<String> = STARTUP_BANNERS.iter().map(|b| b.to_string()).collect();
        let signature = signature.trim().to_lowercase();
        if !signature.is_empty() && signature != "claude" {
            banners.push(format!("welcome to {signature}"));
        }
        Self { banners }
    }

    pub fn detect_startup(&self, clean: &str) -> bool {
        let lower = clean.to_lowercase();
        self.banners.iter().any(|banner| lower.contains(banner.as_str()))
    }

    pub fn prompt_returned(&self, tail: &LineTail) -> bool {
        tail.recent().any(|line| SHELL_PROMPT.is_match(line))
    }

    /// Scan a freshly cleaned chunk (already pushed into `tail`)
    pub fn detect(&self, clean: &str, agent_running: bool, tail: &LineTail) -> Option<PatternVerdict> {
        if !agent_running {
            return self.detect_startup(clean).then_some(PatternVerdict::AgentStarted);
        }
        self.prompt_returned(tail).then_some(PatternVerdict::ShellReturned)
    }
}

/// Incremental UTF-8 decoder for PTY reads; a multi-byte character split
/// across two reads is held back until it completes.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        if chunk.is_empty() {
            return String::new();
        }
        self.carry.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &self.carry;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                        Some(len) => {
                            out.push('\u{FFFD}');
                            rest = &after[len..];
                        }
                    }
                }
            }
        }

        self.carry = rest.to_vec();
        out
    }

    /// Flush whatever is left when the stream ends
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        rest
    }
}
