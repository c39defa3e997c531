use std::collections::HashSet;

use spacelog_types::TRUNCATION_MARKER;

/// Size-bounded, newline-delimited text buffer for one stream.
///
/// Lengths are measured in bytes of UTF-8 text. Every stored line ends with
/// `\n`, and a line is only ever stored once while it is present in the
/// buffer.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    /// Buffer content
    text: String,

    /// Lines currently present in `text`
    lines: HashSet<String>,

    /// Maximum length before truncation
    cap: usize,

    /// Length kept after truncation (excluding the marker line)
    target: usize,
}

impl LogBuffer {
    /// Create an empty buffer.
    ///
    /// `target` is clamped so that the truncated buffer plus marker still fits
    /// into `cap`.
    pub fn new(cap: usize, target: usize) -> Self {
        let marker_len = TRUNCATION_MARKER.len() + 1;
        Self {
            text: String::new(),
            lines: HashSet::new(),
            cap,
            target: target.min(cap.saturating_sub(marker_len)),
        }
    }

    /// Rebuild a buffer from persisted text
    pub fn restore(text: &str, cap: usize, target: usize) -> Self {
        let mut buffer = Self::new(cap, target);
        buffer.text = text.to_string();
        if !buffer.text.is_empty() && !buffer.text.ends_with('\n') {
            buffer.text.push('\n');
        }
        buffer.enforce_cap();
        buffer.rebuild_index();
        buffer
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Whether `line` is currently stored
    pub fn contains_line(&self, line: &str) -> bool {
        self.lines.contains(line)
    }

    /// Append a line unless an identical line is already present.
    /// Returns whether the line was appended.
    pub fn append_unique(&mut self, line: &str) -> bool {
        if line.is_empty() || self.lines.contains(line) {
            return false;
        }
        self.push_line(line);
        self.enforce_cap();
        true
    }

    /// Append several lines with one cap check, skipping duplicates.
    /// Returns the number of lines appended.
    pub fn append_batch<I, S>(&mut self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut appended = 0;
        for line in lines {
            let line = line.as_ref();
            if line.is_empty() || self.lines.contains(line) {
                continue;
            }
            self.push_line(line);
            appended += 1;
        }
        if appended > 0 {
            self.enforce_cap();
        }
        appended
    }

    /// Append a line without the duplicate check (status markers)
    pub fn append_marker(&mut self, line: &str) {
        self.push_line(line);
        self.enforce_cap();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.lines.clear();
    }

    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        self.lines.insert(line.to_string());
    }

    /// Drop lines from the front once the buffer grows beyond the cap.
    /// Returns whether truncation happened.
    fn enforce_cap(&mut self) -> bool {
        if self.text.len() <= self.cap {
            return false;
        }

        let mut start = self.text.len() - self.target;
        while !self.text.is_char_boundary(start) {
            start += 1;
        }
        // Only keep whole lines
        if start > 0 && self.text.as_bytes()[start - 1] != b'\n' {
            start = match self.text[start..].find('\n') {
                Some(pos) => start + pos + 1,
                None => self.text.len(),
            };
        }

        let mut truncated = String::with_capacity(TRUNCATION_MARKER.len() + 1 + self.target);
        truncated.push_str(TRUNCATION_MARKER);
        truncated.push('\n');
        truncated.push_str(&self.text[start..]);
        self.text = truncated;
        self.rebuild_index();
        true
    }

    fn rebuild_index(&mut self) {
        self.lines = self
            .text
            .lines()
            .filter(|line| !line.is_empty() && *line != TRUNCATION_MARKER)
            .map(str::to_string)
            .collect();
    }
}
