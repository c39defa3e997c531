use std::io::{self, Write};

use spacelog_logs::StreamKind;

/// Prints the lines each new snapshot adds, prefixed with the stream label
#[derive(Debug, Default)]
pub struct Printer {
    module: String,
    database: String,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, kind: StreamKind, snapshot: String, out: &mut impl Write) -> io::Result<()> {
        let previous = match kind {
            StreamKind::ModuleLog => &mut self.module,
            StreamKind::DatabaseLog => &mut self.database,
        };
        for line in added(previous, &snapshot).lines() {
            writeln!(out, "{:>6} | {line}", kind.label())?;
        }
        *previous = snapshot;
        out.flush()
    }
}

/// Tail of `current` that was not in `previous`.
///
/// Appends extend the previous snapshot. After truncation the previous last
/// line is looked up again; when it is gone everything counts as new.
fn added<'a>(previous: &str, current: &'a str) -> &'a str {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest;
    }
    let Some(last) = previous.lines().last() else {
        return current;
    };
    let needle = format!("{last}\n");
    current
        .rmatch_indices(needle.as_str())
        .find(|(pos, _)| *pos == 0 || current.as_bytes()[pos - 1] == b'\n')
        .map_or(current, |(pos, _)| &current[pos + needle.len()..])
}
