use chrono::{DateTime, Duration, Utc};

use spacelog_types::StreamSnapshot;

/// Forward step when no record moved the cursor
const IDLE_STEP: Duration = Duration::milliseconds(500);

/// Step past the newest record seen
const RECORD_STEP: Duration = Duration::seconds(1);

/// Per-stream query position and fresh-start suppression window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCursor {
    /// Exclusive lower bound for the next `--since` query
    cursor: DateTime<Utc>,

    /// Suppress records older than `fresh_start_epoch`
    fresh_start: bool,

    fresh_start_epoch: Option<DateTime<Utc>>,
}

impl StreamCursor {
    /// A cursor looking back over a bounded recent-history window
    pub fn recent(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            cursor: now - window,
            fresh_start: false,
            fresh_start_epoch: None,
        }
    }

    /// A cursor right after an explicit clear: query from `now`, hide
    /// everything older than `now - allowance`
    pub fn cleared(now: DateTime<Utc>, allowance: Duration) -> Self {
        Self {
            cursor: now,
            fresh_start: true,
            fresh_start_epoch: Some(now - allowance),
        }
    }

    /// Cursor to use when logging starts.
    ///
    /// A persisted fresh-start survives restarts; anything else falls back to
    /// the recent-history window.
    pub fn on_start(
        persisted: Option<&StreamSnapshot>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        match persisted {
            Some(StreamSnapshot {
                fresh_start: true,
                fresh_start_epoch: Some(epoch),
                cursor,
                ..
            }) => Self {
                cursor: cursor.unwrap_or(now).max(*epoch),
                fresh_start: true,
                fresh_start_epoch: Some(*epoch),
            },
            _ => Self::recent(now, window),
        }
    }

    /// Cursor for restarting logging in the same process
    pub fn resume(&self, now: DateTime<Utc>, window: Duration) -> Self {
        if self.fresh_start {
            self.clone()
        } else {
            Self::recent(now, window)
        }
    }

    pub fn position(&self) -> DateTime<Utc> {
        self.cursor
    }

    pub fn is_fresh_start(&self) -> bool {
        self.fresh_start
    }

    pub fn fresh_start_epoch(&self) -> Option<DateTime<Utc>> {
        if self.fresh_start {
            self.fresh_start_epoch
        } else {
            None
        }
    }

    /// Move forward after a poll.
    ///
    /// Jumps one second past the newest record when it lies beyond the cursor,
    /// otherwise creeps forward half a second so the same window is never
    /// queried forever.
    pub fn advance(&mut self, newest_record: Option<DateTime<Utc>>) {
        self.cursor = match newest_record {
            Some(ts) if ts > self.cursor => ts + RECORD_STEP,
            _ => self.cursor + IDLE_STEP,
        };
    }

    /// Whether a record with this timestamp passes the fresh-start filter.
    /// Records without a timestamp are rejected while fresh-start is active.
    pub fn accepts(&self, record_time: Option<DateTime<Utc>>) -> bool {
        match self.fresh_start_epoch() {
            None => true,
            Some(epoch) => record_time.is_some_and(|ts| ts >= epoch),
        }
    }

    /// Copy cursor fields into a snapshot for persistence
    pub fn write_to(&self, snapshot: &mut StreamSnapshot) {
        snapshot.cursor = Some(self.cursor);
        snapshot.fresh_start = self.fresh_start;
        snapshot.fresh_start_epoch = self.fresh_start_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 21, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_advance_past_newest_record() {
        let mut cursor = StreamCursor::recent(t0(), Duration::minutes(5));
        cursor.advance(Some(t0()));
        assert_eq!(cursor.position(), t0() + Duration::seconds(1));
    }

    #[test]
    fn test_advance_without_records_still_moves() {
        let mut cursor = StreamCursor::recent(t0(), Duration::zero());
        cursor.advance(None);
        assert_eq!(cursor.position(), t0() + Duration::milliseconds(500));
        // An older record must not pull the cursor back
        cursor.advance(Some(t0() - Duration::minutes(1)));
        assert_eq!(cursor.position(), t0() + Duration::seconds(1));
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut cursor = StreamCursor::recent(t0(), Duration::minutes(1));
        let samples = [
            Some(t0() - Duration::minutes(2)),
            None,
            Some(t0() + Duration::seconds(30)),
            Some(t0()),
            None,
            Some(t0() + Duration::seconds(29)),
        ];
        let mut last = cursor.position();
        for sample in samples {
            cursor.advance(sample);
            assert!(cursor.position() >= last);
            last = cursor.position();
        }
    }

    #[test]
    fn test_fresh_start_rejects_older_records() {
        let cursor = StreamCursor::cleared(t0(), Duration::seconds(5));
        let epoch = t0() - Duration::seconds(5);
        assert!(!cursor.accepts(Some(epoch - Duration::seconds(1))));
        assert!(cursor.accepts(Some(epoch + Duration::seconds(1))));
        assert!(!cursor.accepts(None));
    }

    #[test]
    fn test_normal_mode_accepts_everything() {
        let cursor = StreamCursor::recent(t0(), Duration::minutes(5));
        assert!(cursor.accepts(None));
        assert!(cursor.accepts(Some(t0() - Duration::days(1))));
    }

    #[test]
    fn test_persisted_fresh_start_survives_restart() {
        let mut snapshot = StreamSnapshot::default();
        StreamCursor::cleared(t0(), Duration::seconds(5)).write_to(&mut snapshot);

        let later = t0() + Duration::hours(1);
        let restored = StreamCursor::on_start(Some(&snapshot), later, Duration::minutes(5));
        assert!(restored.is_fresh_start());
        assert_eq!(restored.fresh_start_epoch(), Some(t0() - Duration::seconds(5)));
        assert_eq!(restored.position(), t0());
    }

    #[test]
    fn test_resume_keeps_fresh_start_only() {
        let later = t0() + Duration::minutes(10);
        let cleared = StreamCursor::cleared(t0(), Duration::seconds(5));
        assert_eq!(cleared.resume(later, Duration::minutes(5)), cleared);

        let recent = StreamCursor::recent(t0(), Duration::minutes(5));
        assert_eq!(
            recent.resume(later, Duration::minutes(5)).position(),
            t0() + Duration::minutes(5)
        );
    }

    #[test]
    fn test_start_without_fresh_start_uses_recent_window() {
        let snapshot = StreamSnapshot {
            cursor: Some(t0() - Duration::days(3)),
            ..Default::default()
        };
        let cursor = StreamCursor::on_start(Some(&snapshot), t0(), Duration::minutes(5));
        assert!(!cursor.is_fresh_start());
        assert_eq!(cursor.position(), t0() - Duration::minutes(5));
    }
}
