use regex::{Regex, RegexSet};

/// Journal and transport chatter that never carries module output
const STRUCTURAL_PATTERNS: &[&str] = &[
    // journalctl meta lines: "-- No entries --", "-- Boot 1a2b... --", "-- Journal begins at ..."
    r"^--\s",
    // WSL start-up banners
    r"^wsl:\s",
    r"^<\d+>WSL\s",
    // service manager lines wrapped in the journal prefix
    r"\ssystemd(?:-[a-z]+)?\[\d+\]:\s",
    r"^(?:Started|Stopped|Starting|Stopping|Reloading|Reloaded)\s.+\.service\.?$",
    r"\.service:\s(?:Consumed\s.+CPU time|Deactivated successfully|Main process exited|Scheduled restart job|Failed with result)",
    // journal permission hints and ssh host key notices
    r"^Hint: You are currently not seeing messages",
    r"^Warning: Permanently added .+ to the list of known hosts",
];

/// Disconnect chatter the database log emits while the server is unreachable
const TRANSIENT_ERRORS: &[&str] = &[
    "connection refused",
    "error trying to connect",
    "tcp connect error",
    "os error 111",
    "failed to connect",
    "connection reset by peer",
    "broken pipe",
    "connection closed before message completed",
    "error sending request",
    "websocket closed",
    "unexpected eof",
];

/// Compiled noise tables used by the normalizer
#[derive(Clone, Debug)]
pub struct NoiseFilter {
    structural: RegexSet,
    transient: Regex,
}

impl NoiseFilter {
    pub fn new() -> Self {
        let alternation = TRANSIENT_ERRORS
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");

        Self {
            structural: RegexSet::new(STRUCTURAL_PATTERNS).expect("valid structural noise patterns"),
            transient: Regex::new(&format!("(?i)(?:{alternation})"))
                .expect("valid transient error pattern"),
        }
    }

    /// Lines dropped from every stream unconditionally
    pub fn is_structural(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        trimmed.is_empty() || self.structural.is_match(trimmed)
    }

    /// Known transient network errors of the database stream
    pub fn is_transient_error(&self, message: &str) -> bool {
        self.transient.is_match(message)
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}
