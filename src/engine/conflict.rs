use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Turn a raw `(start, end)` pair into a span, rejecting empty and inverted ranges.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_title(title: Option<&str>) -> Result<(), EngineError> {
    if title.is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

pub(crate) fn validate_metadata(metadata: &Metadata) -> Result<(), EngineError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(EngineError::LimitExceeded("too many metadata entries"));
    }
    if metadata
        .iter()
        .any(|(k, v)| k.len() > MAX_NAME_LEN || v.len() > MAX_METADATA_VALUE_LEN)
    {
        return Err(EngineError::LimitExceeded("metadata entry too long"));
    }
    Ok(())
}

/// First non-cancelled booking on `rs` overlapping `span`, ignoring `exclude`.
pub fn find_conflict<'a>(
    rs: &'a ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    conflicts(rs, span, exclude).next()
}

pub fn has_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_some()
}

/// Every non-cancelled booking overlapping `span`, in start order.
pub fn conflicts<'a>(
    rs: &'a ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Booking> {
    rs.overlapping(span)
        .filter(move |b| b.status.is_live() && Some(b.id) != exclude)
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(existing.id))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const H: Ms = HOUR_MS;

    fn resource_with(bookings: &[(Ms, Ms, BookingStatus)]) -> ResourceState {
        let mut rs = ResourceState::new(
            Ulid::new(),
            "Crane".into(),
            ResourceKind::Equipment,
            true,
            Metadata::new(),
            0,
        );
        for &(start, end, status) in bookings {
            rs.insert_booking(Booking {
                id: Ulid::new(),
                resource_id: rs.id,
                span: Span::new(start, end),
                status,
                priority: 0,
                requester: Requester::default(),
                title: None,
                metadata: Metadata::new(),
                created_at: 0,
                updated_at: 0,
            });
        }
        rs
    }

    #[test]
    fn interval_must_be_non_empty() {
        assert!(matches!(
            validate_interval(5, 5),
            Err(EngineError::InvalidInterval { start: 5, end: 5 })
        ));
        assert!(validate_interval(6, 5).is_err());
        assert_eq!(validate_interval(5, 6).unwrap(), Span::new(5, 6));
    }

    #[test]
    fn span_limits() {
        assert!(validate_span(&Span::new(-10, 10)).is_err());
        assert!(validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)).is_err());
        assert!(validate_span(&Span::new(0, H)).is_ok());
    }

    #[test]
    fn detects_all_overlap_shapes() {
        let rs = resource_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        // starts inside
        assert!(has_conflict(&rs, &Span::new(11 * H, 13 * H), None));
        // ends inside
        assert!(has_conflict(&rs, &Span::new(9 * H, 11 * H), None));
        // contains
        assert!(has_conflict(&rs, &Span::new(9 * H, 13 * H), None));
        // contained
        assert!(has_conflict(&rs, &Span::new(10 * H + 1, 12 * H - 1), None));
        // back-to-back on either side
        assert!(!has_conflict(&rs, &Span::new(12 * H, 13 * H), None));
        assert!(!has_conflict(&rs, &Span::new(9 * H, 10 * H), None));
    }

    #[test]
    fn cancelled_bookings_do_not_block() {
        let rs = resource_with(&[(10 * H, 12 * H, BookingStatus::Cancelled)]);
        assert!(!has_conflict(&rs, &Span::new(10 * H, 12 * H), None));
    }

    #[test]
    fn completed_bookings_still_block() {
        let rs = resource_with(&[(10 * H, 12 * H, BookingStatus::Completed)]);
        assert!(has_conflict(&rs, &Span::new(10 * H, 12 * H), None));
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let rs = resource_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        let own = rs.bookings[0].id;
        assert!(!has_conflict(&rs, &Span::new(11 * H, 13 * H), Some(own)));
        assert!(has_conflict(&rs, &Span::new(11 * H, 13 * H), Some(Ulid::new())));
    }

    #[test]
    fn conflicts_lists_every_overlap() {
        let rs = resource_with(&[
            (8 * H, 9 * H, BookingStatus::Confirmed),
            (9 * H, 10 * H, BookingStatus::Cancelled),
            (10 * H, 11 * H, BookingStatus::Confirmed),
            (13 * H, 14 * H, BookingStatus::Confirmed),
        ]);
        let query = Span::new(8 * H + 30, 12 * H);
        let hits: Vec<Ms> = conflicts(&rs, &query, None).map(|b| b.span.start).collect();
        assert_eq!(hits, vec![8 * H, 10 * H]);
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(a0 in 0i64..10_000, al in 1i64..500, b0 in 0i64..10_000, bl in 1i64..500) {
            let a = Span::new(a0, a0 + al);
            let b = Span::new(b0, b0 + bl);
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));

            let ra = resource_with(&[(a.start, a.end, BookingStatus::Confirmed)]);
            let rb = resource_with(&[(b.start, b.end, BookingStatus::Confirmed)]);
            prop_assert_eq!(has_conflict(&ra, &b, None), has_conflict(&rb, &a, None));
        }
    }
}
