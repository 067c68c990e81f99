use chrono::{FixedOffset, NaiveDate};

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// The `[local midnight, next local midnight)` window of `day` in `zone`.
pub fn day_window(day: NaiveDate, zone: &FixedOffset) -> Option<Span> {
    let start = day
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(*zone)
        .single()?
        .timestamp_millis();
    Some(Span::new(start, start + DAY_MS))
}

/// Free intervals of `window` not covered by `busy`.
///
/// `busy` must be sorted by start. Busy spans reaching outside the window are clipped
/// to it; overlapping busy spans are tolerated (the cursor only moves forward).
/// The result is ordered and pairwise disjoint.
pub fn free_slots<'a>(busy: impl IntoIterator<Item = &'a Span>, window: &Span) -> Vec<Span> {
    let mut free = Vec::new();
    let mut cursor = window.start;

    for b in busy {
        let start = b.start.max(window.start);
        let end = b.end.min(window.end);
        if start >= end {
            continue; // entirely outside the window
        }
        if cursor < start {
            free.push(Span::new(cursor, start));
        }
        cursor = cursor.max(end);
    }

    if cursor < window.end {
        free.push(Span::new(cursor, window.end));
    }
    free
}
