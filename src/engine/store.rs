use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// In-memory booking store: per-resource state behind its own lock, plus a
/// booking id → resource id index for lookups by booking.
pub struct Store {
    resources: DashMap<Ulid, SharedResourceState>,
    booking_to_resource: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            booking_to_resource: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every resource handle. Callers lock each one individually.
    pub fn resources(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    pub fn insert_resource(&self, state: ResourceState) {
        self.resources
            .insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Drop a resource and forget its bookings. Caller holds the write lock on `rs`.
    pub fn retire_resource(&self, rs: &mut ResourceState) {
        rs.retired = true;
        for booking in &rs.bookings {
            self.booking_to_resource.remove(&booking.id);
        }
        self.resources.remove(&rs.id);
    }

    // ── Booking index ────────────────────────────────────────

    pub fn contains_booking(&self, id: &Ulid) -> bool {
        self.booking_to_resource.contains_key(id)
    }

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a per-resource event to `rs` (caller holds the lock).
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated {
                name,
                kind,
                active,
                metadata,
                at,
                ..
            } => {
                rs.name = name.clone();
                rs.kind = *kind;
                rs.active = *active;
                rs.metadata = metadata.clone();
                rs.updated_at = *at;
            }
            Event::BookingCreated { booking } => {
                self.booking_to_resource.insert(booking.id, booking.resource_id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingUpdated {
                id,
                span,
                priority,
                requester,
                title,
                metadata,
                at,
                ..
            } => {
                if let Some(mut booking) = rs.remove_booking(*id) {
                    booking.span = *span;
                    booking.priority = *priority;
                    booking.requester = requester.clone();
                    booking.title = title.clone();
                    booking.metadata = metadata.clone();
                    booking.updated_at = *at;
                    rs.insert_booking(booking);
                }
            }
            Event::BookingStatusChanged { id, status, at, .. } => {
                if let Some(booking) = rs.booking_mut(*id) {
                    booking.status = *status;
                    booking.updated_at = *at;
                }
            }
            Event::BookingDeleted { id, .. } => {
                rs.remove_booking(*id);
                self.booking_to_resource.remove(id);
            }
            // ResourceCreated/Deleted are handled at the map level, not here
            Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
        }
    }
}
