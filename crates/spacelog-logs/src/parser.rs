use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;

use spacelog_types::{StreamKind, canonical_line};

use crate::cursor::StreamCursor;
use crate::filter::NoiseFilter;

/// ISO-8601 timestamp with optional fraction and zone
const ISO: &str = r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?";

/// Per-poll inputs the normalizer needs besides the raw line
#[derive(Clone, Copy, Debug)]
pub struct NormalizeContext<'a> {
    /// Cursor of the stream, for fresh-start rejection
    pub cursor: &'a StreamCursor,

    /// Wall-clock time used when a record has no timestamp
    pub now: DateTime<Utc>,

    /// Keep transient database errors outside the stop grace period
    pub verbose: bool,

    /// When the server was last marked stopped
    pub server_stopped_at: Option<DateTime<Utc>>,

    /// How long after a stop transient errors are always dropped
    pub stop_grace: Duration,
}

impl NormalizeContext<'_> {
    fn within_stop_grace(&self) -> bool {
        self.server_stopped_at
            .is_some_and(|stopped| self.now - stopped <= self.stop_grace)
    }
}

/// A raw journal record split into its parts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Timestamp the journal attached to the record
    pub journal_time: Option<DateTime<Utc>>,

    /// The record's own timestamp: embedded in the message if present,
    /// otherwise the journal's
    pub time: Option<DateTime<Utc>>,

    /// Message body with timestamps and level token removed
    pub message: String,

    /// Whether the level token marked an error
    pub is_error: bool,
}

/// Turns raw journal records into canonical `[YYYY-MM-DD HH:MM:SS] message` lines
#[derive(Clone, Debug)]
pub struct LineNormalizer {
    stream: StreamKind,
    noise: NoiseFilter,
    canonical: Regex,
    wrapper: Regex,
    iso_offset: Regex,
    iso_zulu: Regex,
    iso_anywhere: Regex,
    embedded: Regex,
    level: Regex,
}

impl LineNormalizer {
    pub fn new(stream: StreamKind) -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("valid normalizer pattern");
        Self {
            stream,
            noise: NoiseFilter::new(),
            canonical: compile(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\]"),
            // "<ts> <host> <ident>[<pid>]: <message>"
            wrapper: compile(&format!(
                r"^(?P<ts>{ISO})\s+(?P<host>\S+)\s+(?P<ident>[^\s\[\]:]+)\[(?P<pid>\d+)\]:\s?(?P<msg>.*)$"
            )),
            iso_offset: compile(
                r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d+)?[+-]\d{2}:?\d{2})\s*(?P<msg>.*)$",
            ),
            iso_zulu: compile(
                r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d+)?Z)\s*(?P<msg>.*)$",
            ),
            iso_anywhere: compile(&format!(r"(?P<ts>{ISO})")),
            embedded: compile(&format!(r"^\s*(?P<ts>{ISO})\s*(?P<msg>.*)$")),
            level: compile(r"^(?P<level>TRACE|DEBUG|INFO|ERROR|FATAL|PANIC)\b:?\s*"),
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Journal timestamp of a raw record, used to advance the cursor.
    /// Noise records count too.
    pub fn record_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        [&self.wrapper, &self.iso_offset, &self.iso_zulu]
            .into_iter()
            .find_map(|re| re.captures(raw).and_then(|caps| parse_iso(&caps["ts"])))
    }

    /// Split a raw record into timestamp and message.
    ///
    /// Returns `None` for already-canonical lines and for noise.
    pub fn parse(&self, raw: &str) -> Option<ParsedRecord> {
        let raw = raw.trim_end_matches(['\r', '\n']);

        // Already formatted once, never wrap twice
        if self.canonical.is_match(raw.trim_start()) {
            return None;
        }
        if self.noise.is_structural(raw) {
            return None;
        }

        let raw = raw.trim();
        let (journal_time, body) = self.split_timestamp(raw);

        // The message may repeat its own timestamp; that one wins
        let embedded = self.embedded.captures(&body).and_then(|caps| {
            parse_iso(&caps["ts"]).map(|ts| (ts, caps["msg"].to_string()))
        });
        let (time, body) = match embedded {
            Some((ts, rest)) => (Some(ts), rest),
            None => (journal_time, body),
        };

        let level = self.level.captures(&body).map(|caps| {
            let is_error = matches!(&caps["level"], "ERROR" | "FATAL" | "PANIC");
            (is_error, caps.get(0).map_or(0, |m| m.end()))
        });
        let (is_error, message) = match level {
            Some((is_error, end)) => (is_error, body[end..].to_string()),
            None => (false, body),
        };

        let message = message.trim().to_string();
        if message.is_empty() {
            return None;
        }

        Some(ParsedRecord {
            journal_time,
            time,
            message,
            is_error,
        })
    }

    /// Produce the canonical line for a raw record, or `None` to discard it
    pub fn normalize(&self, raw: &str, ctx: &NormalizeContext<'_>) -> Option<String> {
        let record = self.parse(raw)?;

        if self.stream == StreamKind::DatabaseLog
            && self.noise.is_transient_error(&record.message)
            && (!ctx.verbose || ctx.within_stop_grace())
        {
            return None;
        }

        if !ctx.cursor.accepts(record.time) {
            return None;
        }

        let marker = if record.is_error {
            self.stream.error_marker()
        } else {
            ""
        };
        Some(canonical_line(
            record.time.unwrap_or(ctx.now),
            marker,
            &record.message,
        ))
    }

    /// Try the known timestamp layouts in order, returning the parsed time and
    /// the line with the timestamp removed
    fn split_timestamp(&self, raw: &str) -> (Option<DateTime<Utc>>, String) {
        for re in [&self.wrapper, &self.iso_offset, &self.iso_zulu] {
            let Some(caps) = re.captures(raw) else {
                continue;
            };
            if let Some(ts) = parse_iso(&caps["ts"]) {
                return (Some(ts), caps["msg"].to_string());
            }
        }

        let found = self
            .iso_anywhere
            .find(raw)
            .and_then(|m| parse_iso(m.as_str()).map(|ts| (m, ts)));
        if let Some((m, ts)) = found {
            let before = raw[..m.start()].trim_end();
            let after = raw[m.end()..].trim_start();
            let body = match (before.is_empty(), after.is_empty()) {
                (true, _) => after.to_string(),
                (false, true) => before.to_string(),
                (false, false) => format!("{before} {after}"),
            };
            return (Some(ts), body);
        }

        (None, raw.to_string())
    }
}

/// Parse the ISO-8601 variants journalctl and SpacetimeDB emit.
/// Timestamps without a zone are taken as UTC.
fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    let s = s.replacen(' ', "T", 1).replace(',', ".");

    if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
        return Some(ts.with_timezone(&Utc));
    }
    // short-iso uses "+0200" offsets
    if let Ok(ts) = DateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
