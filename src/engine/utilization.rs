use ulid::Ulid;

use crate::model::*;

/// Booked-vs-total hours of `rs` over `[period_start, period_end]`.
///
/// Only non-cancelled bookings lying entirely inside the period count; bookings
/// straddling either boundary are left out rather than prorated.
pub fn utilization(rs: &ResourceState, period_start: Ms, period_end: Ms) -> Utilization {
    let counted = rs
        .live()
        .filter(|b| b.span.start >= period_start && b.span.end <= period_end)
        .map(|b| b.span);
    summarize(rs.id, period_start, period_end, counted)
}

fn summarize(
    resource_id: Ulid,
    period_start: Ms,
    period_end: Ms,
    spans: impl Iterator<Item = Span>,
) -> Utilization {
    let mut booked_ms: Ms = 0;
    let mut booking_count = 0;
    for span in spans {
        booked_ms += span.duration_ms();
        booking_count += 1;
    }

    let total_hours = (period_end - period_start) as f64 / HOUR_MS as f64;
    let booked_hours = booked_ms as f64 / HOUR_MS as f64;
    let rate = if total_hours > 0.0 {
        booked_hours / total_hours * 100.0
    } else {
        0.0
    };

    Utilization {
        resource_id,
        period_start,
        period_end,
        total_hours,
        booked_hours,
        rate,
        booking_count,
    }
}
