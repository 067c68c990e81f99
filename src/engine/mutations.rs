use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, validate_interval, validate_metadata, validate_span, validate_title,
};
use super::{Engine, EngineError};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    Ok(())
}

fn booking_info(rs: &ResourceState, id: Ulid) -> Result<BookingInfo, EngineError> {
    rs.booking(id)
        .map(|b| rs.booking_info(b))
        .ok_or(EngineError::NotFound(id))
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, new: NewResource) -> Result<ResourceInfo, EngineError> {
        let _gate = self.mutation_gate().await;
        validate_name(&new.name)?;
        validate_metadata(&new.metadata)?;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains_resource(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let at = self.now();
        let event = Event::ResourceCreated {
            id: new.id,
            name: new.name.clone(),
            kind: new.kind,
            active: new.active,
            metadata: new.metadata.clone(),
            at,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(new.id, new.name, new.kind, new.active, new.metadata, at);
        let info = rs.info();
        self.store.insert_resource(rs);
        Ok(info)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<ResourceInfo, EngineError> {
        let _gate = self.mutation_gate().await;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(metadata) = &patch.metadata {
            validate_metadata(metadata)?;
        }
        let mut guard = self.lock_resource(id).await?;

        let event = Event::ResourceUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            kind: patch.kind.unwrap_or(guard.kind),
            active: patch.active.unwrap_or(guard.active),
            metadata: patch.metadata.unwrap_or_else(|| guard.metadata.clone()),
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Remove a resource together with its past and cancelled bookings. Refused
    /// while any booking still holds the resource now or later.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.mutation_gate().await;
        let mut guard = self.lock_resource(id).await?;

        let now = self.now();
        let count = guard.live().filter(|b| b.span.end > now).count();
        if count > 0 {
            return Err(EngineError::HasActiveDependents { id, count });
        }

        self.wal_append(&Event::ResourceDeleted { id }).await?;
        self.store.retire_resource(&mut guard);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────

    pub async fn create_booking(&self, new: NewBooking) -> Result<BookingInfo, EngineError> {
        let _gate = self.mutation_gate().await;
        let span = validate_interval(new.start, new.end)?;
        let now = self.now();
        if span.start < now {
            return Err(EngineError::PastBooking {
                start: span.start,
                now,
            });
        }
        validate_span(&span)?;
        validate_title(new.title.as_deref())?;
        validate_metadata(&new.metadata)?;
        if self.store.contains_booking(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let mut guard = self.lock_resource(new.resource_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        if !guard.active {
            return Err(EngineError::InactiveResource(new.resource_id));
        }
        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id: new.id,
            resource_id: new.resource_id,
            span,
            status: BookingStatus::Confirmed,
            priority: new.priority.unwrap_or(0),
            requester: new.requester,
            title: new.title,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let info = guard.booking_info(&booking);
        self.persist_and_apply(&mut guard, &Event::BookingCreated { booking })
            .await?;
        Ok(info)
    }

    /// Apply a partial update. A new time range is re-checked for shape and
    /// conflicts (ignoring the booking itself) but not against the clock.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.mutation_gate().await;
        if let Some(Some(title)) = &patch.title {
            validate_title(Some(title))?;
        }
        if let Some(metadata) = &patch.metadata {
            validate_metadata(metadata)?;
        }

        let mut guard = self.lock_booking(id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();

        let span = if patch.changes_time() {
            let span = validate_interval(
                patch.start.unwrap_or(current.span.start),
                patch.end.unwrap_or(current.span.end),
            )?;
            validate_span(&span)?;
            if !guard.active {
                return Err(EngineError::InactiveResource(guard.id));
            }
            check_no_conflict(&guard, &span, Some(id))?;
            span
        } else {
            current.span
        };

        let mut requester = current.requester;
        if let Some(user_id) = patch.user_id {
            requester.user_id = user_id;
        }
        if let Some(company_id) = patch.company_id {
            requester.company_id = company_id;
        }
        if let Some(store_id) = patch.store_id {
            requester.store_id = store_id;
        }

        let event = Event::BookingUpdated {
            id,
            resource_id: current.resource_id,
            span,
            priority: patch.priority.unwrap_or(current.priority),
            requester,
            title: patch.title.unwrap_or(current.title),
            metadata: patch.metadata.unwrap_or(current.metadata),
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        booking_info(&guard, id)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.transition(id, BookingStatus::Cancelled).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.transition(id, BookingStatus::Completed).await
    }

    /// `confirmed → cancelled | completed`. Repeating a transition reports the
    /// `Already*` kind; crossing between the two terminal states is illegal.
    async fn transition(&self, id: Ulid, to: BookingStatus) -> Result<BookingInfo, EngineError> {
        let _gate = self.mutation_gate().await;
        let mut guard = self.lock_booking(id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;

        match (booking.status, to) {
            (BookingStatus::Confirmed, _) => {}
            (BookingStatus::Cancelled, BookingStatus::Cancelled) => {
                return Err(EngineError::AlreadyCancelled(id));
            }
            (BookingStatus::Completed, BookingStatus::Completed) => {
                return Err(EngineError::AlreadyCompleted(id));
            }
            (status, _) => {
                return Err(EngineError::IllegalTransition {
                    id,
                    status,
                    action: if to == BookingStatus::Cancelled {
                        "cancel"
                    } else {
                        "complete"
                    },
                });
            }
        }

        let event = Event::BookingStatusChanged {
            id,
            resource_id: booking.resource_id,
            status: to,
            at: self.now(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        booking_info(&guard, id)
    }

    /// Hard delete, whatever the status.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.mutation_gate().await;
        let mut guard = self.lock_booking(id).await?;
        let event = Event::BookingDeleted {
            id,
            resource_id: guard.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}
