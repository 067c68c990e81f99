use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Free-form key/value attributes carried by resources and bookings.
pub type Metadata = BTreeMap<String, String>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Equipment,
    Vehicle,
    Crew,
    Room,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Equipment => "equipment",
            ResourceKind::Vehicle => "vehicle",
            ResourceKind::Crew => "crew",
            ResourceKind::Room => "room",
            ResourceKind::Other => "other",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "equipment" => Ok(ResourceKind::Equipment),
            "vehicle" => Ok(ResourceKind::Vehicle),
            "crew" => Ok(ResourceKind::Crew),
            "room" => Ok(ResourceKind::Room),
            "other" => Ok(ResourceKind::Other),
            _ => Err(format!("unknown resource kind: {s}")),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `confirmed → completed` and `confirmed → cancelled`; both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Cancelled bookings never block the resource.
    pub fn is_live(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            _ => Err(format!("unknown booking status: {s}")),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a booking is attributed to. Weak references into the identity context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub store_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub priority: i32,
    pub requester: Requester,
    pub title: Option<String>,
    pub metadata: Metadata,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    pub active: bool,
    pub metadata: Metadata,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Set under the write lock when the resource is deleted; writers holding a stale
    /// handle must treat the resource as gone.
    pub retired: bool,
    /// All bookings (any status), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: String,
        kind: ResourceKind,
        active: bool,
        metadata: Metadata,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            active,
            metadata,
            created_at,
            updated_at: created_at,
            retired: false,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window, in start order.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Bookings that still hold the resource (anything but cancelled).
    pub fn live(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_live())
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            active: self.active,
            metadata: self.metadata.clone(),
            booking_count: self.bookings.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Booking joined with its resource's display fields.
    pub fn booking_info(&self, booking: &Booking) -> BookingInfo {
        BookingInfo {
            booking: booking.clone(),
            resource_name: self.name.clone(),
            resource_kind: self.kind,
        }
    }
}

/// WAL record format. Flat where possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        active: bool,
        metadata: Metadata,
        at: Ms,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        active: bool,
        metadata: Metadata,
        at: Ms,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        priority: i32,
        requester: Requester,
        title: Option<String>,
        metadata: Metadata,
        at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// The resource whose state this event mutates (for non-Create/Delete events).
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.resource_id),
            Event::BookingUpdated { resource_id, .. }
            | Event::BookingStatusChanged { resource_id, .. }
            | Event::BookingDeleted { resource_id, .. } => Some(*resource_id),
            Event::ResourceUpdated { id, .. } => Some(*id),
            Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
        }
    }
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    pub active: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub kind: Option<ResourceKind>,
    pub active: Option<bool>,
    pub metadata: Option<Metadata>,
}

/// Raw booking request; `start`/`end` are validated by the engine, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub requester: Requester,
    pub priority: Option<i32>,
    pub title: Option<String>,
    pub metadata: Metadata,
}

/// Partial booking update. `title: Some(None)` clears the title; requester fields
/// follow the same convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub priority: Option<i32>,
    pub title: Option<Option<String>>,
    pub metadata: Option<Metadata>,
    pub user_id: Option<Option<String>>,
    pub company_id: Option<Option<String>>,
    pub store_id: Option<Option<String>>,
}

impl BookingPatch {
    pub fn changes_time(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub kind: Option<ResourceKind>,
    pub active: Option<bool>,
    pub page: PageRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub company_id: Option<String>,
    pub store_id: Option<String>,
    pub user_id: Option<String>,
    pub resource_id: Option<Ulid>,
    pub resource_kind: Option<ResourceKind>,
    pub status: Option<BookingStatus>,
    /// Inclusive lower bound on `start`.
    pub from: Option<Ms>,
    /// Inclusive upper bound on `start`.
    pub to: Option<Ms>,
    pub page: PageRequest,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking, kind: ResourceKind) -> bool {
        let requester = &booking.requester;
        self.company_id
            .as_ref()
            .is_none_or(|c| requester.company_id.as_ref() == Some(c))
            && self
                .store_id
                .as_ref()
                .is_none_or(|s| requester.store_id.as_ref() == Some(s))
            && self
                .user_id
                .as_ref()
                .is_none_or(|u| requester.user_id.as_ref() == Some(u))
            && self.resource_id.is_none_or(|r| booking.resource_id == r)
            && self.resource_kind.is_none_or(|k| kind == k)
            && self.status.is_none_or(|s| booking.status == s)
            && self.from.is_none_or(|f| booking.span.start >= f)
            && self.to.is_none_or(|t| booking.span.start <= t)
    }
}

// ── Query result types ───────────────────────────────────────────

/// A page of results plus the unpaginated match count.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    pub active: bool,
    pub metadata: Metadata,
    pub booking_count: usize,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDetail {
    pub resource: ResourceInfo,
    /// Next bookings starting at or after now, ascending.
    pub upcoming: Vec<BookingInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub booking: Booking,
    pub resource_name: String,
    pub resource_kind: ResourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub resource: ResourceInfo,
    pub day: chrono::NaiveDate,
    pub window: Span,
    pub bookings: Vec<BookingInfo>,
    pub free: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utilization {
    pub resource_id: Ulid,
    pub period_start: Ms,
    pub period_end: Ms,
    pub total_hours: f64,
    pub booked_hours: f64,
    /// Percentage in `[0, 100]`.
    pub rate: f64,
    pub booking_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            span: Span::new(start, end),
            status,
            priority: 0,
            requester: Requester::default(),
            title: None,
            metadata: Metadata::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn resource() -> ResourceState {
        ResourceState::new(
            Ulid::new(),
            "Excavator".into(),
            ResourceKind::Equipment,
            true,
            Metadata::new(),
            0,
        )
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert_eq!(Span::new(0, HOUR_MS * 3).hours(), 3.0);
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut rs = resource();
        rs.insert_booking(booking(300, 400, BookingStatus::Confirmed));
        rs.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        rs.insert_booking(booking(200, 300, BookingStatus::Cancelled));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = resource();
        let a = booking(0, 50, BookingStatus::Confirmed);
        let b = booking(100, 150, BookingStatus::Confirmed);
        let c = booking(200, 250, BookingStatus::Confirmed);
        let (ida, idb, idc) = (a.id, b.id, c.id);
        rs.insert_booking(a);
        rs.insert_booking(b);
        rs.insert_booking(c);
        assert!(rs.remove_booking(idb).is_some());
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.bookings[0].id, ida);
        assert_eq!(rs.bookings[1].id, idc);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut rs = resource();
        rs.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        rs.insert_booking(booking(450, 600, BookingStatus::Confirmed));
        rs.insert_booking(booking(1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));

        // ending exactly at query.start is not overlapping
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn live_excludes_cancelled() {
        let mut rs = resource();
        rs.insert_booking(booking(0, 10, BookingStatus::Cancelled));
        rs.insert_booking(booking(10, 20, BookingStatus::Completed));
        rs.insert_booking(booking(20, 30, BookingStatus::Confirmed));
        assert_eq!(rs.live().count(), 2);
    }

    #[test]
    fn status_and_kind_parse() {
        assert_eq!("Cancelled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("pending".parse::<BookingStatus>().is_err());
        assert_eq!("VEHICLE".parse::<ResourceKind>(), Ok(ResourceKind::Vehicle));
        assert_eq!(ResourceKind::Crew.to_string(), "crew");
    }

    #[test]
    fn filter_matches_requester_and_range() {
        let mut b = booking(1_000, 2_000, BookingStatus::Confirmed);
        b.requester.user_id = Some("u1".into());
        let filter = BookingFilter {
            user_id: Some("u1".into()),
            from: Some(1_000),
            to: Some(1_000),
            ..Default::default()
        };
        assert!(filter.matches(&b, ResourceKind::Room));

        let other_user = BookingFilter {
            user_id: Some("u2".into()),
            ..Default::default()
        };
        assert!(!other_user.matches(&b, ResourceKind::Room));

        let wrong_kind = BookingFilter {
            resource_kind: Some(ResourceKind::Vehicle),
            ..Default::default()
        };
        assert!(!wrong_kind.matches(&b, ResourceKind::Room));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut metadata = Metadata::new();
        metadata.insert("plate".into(), "KA-123".into());
        let event = Event::BookingCreated {
            booking: Booking {
                metadata,
                title: Some("Site survey".into()),
                ..booking(0, HOUR_MS, BookingStatus::Confirmed)
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
