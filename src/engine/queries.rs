use chrono::NaiveDate;
use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{day_window, free_slots};
use super::conflict::{conflicts, validate_interval, validate_span};
use super::utilization::utilization;
use super::{Engine, EngineError};

/// Apply `limit`/`offset` after counting, so `total` reflects the whole match set.
fn paginate<T>(
    items: Vec<T>,
    page: PageRequest,
    default_limit: usize,
    max_limit: usize,
) -> Page<T> {
    let total = items.len();
    let limit = page.limit.unwrap_or(default_limit).min(max_limit);
    let offset = page.offset.unwrap_or(0);
    Page {
        items: items.into_iter().skip(offset).take(limit).collect(),
        total,
    }
}

impl Engine {
    async fn read_resource(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Visit every live resource under its own read lock. Only one lock is held
    /// at a time, so scans never form a lock cycle with each other or with writers.
    async fn scan(&self, mut visit: impl FnMut(&ResourceState)) {
        for rs in self.store.resources() {
            let guard = rs.read().await;
            if !guard.retired {
                visit(&*guard);
            }
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn list_resources(&self, filter: &ResourceFilter) -> Page<ResourceInfo> {
        let mut items: Vec<ResourceInfo> = Vec::new();
        self.scan(|rs| {
            if filter.kind.is_none_or(|k| rs.kind == k)
                && filter.active.is_none_or(|a| rs.active == a)
            {
                items.push(rs.info());
            }
        })
        .await;
        items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        // resource lists are unbounded unless the caller asks for a page
        paginate(items, filter.page, usize::MAX, usize::MAX)
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceDetail, EngineError> {
        let guard = self.read_resource(id).await?;
        let now = self.now();
        let upcoming = guard
            .bookings
            .iter()
            .filter(|b| b.span.start >= now)
            .take(RESOURCE_DETAIL_UPCOMING)
            .map(|b| guard.booking_info(b))
            .collect();
        Ok(ResourceDetail {
            resource: guard.info(),
            upcoming,
        })
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let resource_id = self
            .store
            .resource_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self
            .read_resource(resource_id)
            .await
            .map_err(|_| EngineError::NotFound(id))?;
        guard
            .booking(id)
            .map(|b| guard.booking_info(b))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Page<BookingInfo> {
        let mut items: Vec<BookingInfo> = Vec::new();
        let mut collect = |rs: &ResourceState| {
            items.extend(
                rs.bookings
                    .iter()
                    .filter(|b| filter.matches(b, rs.kind))
                    .map(|b| rs.booking_info(b)),
            );
        };
        match filter.resource_id {
            Some(id) => {
                if let Ok(guard) = self.read_resource(id).await {
                    collect(&*guard);
                }
            }
            None => self.scan(&mut collect).await,
        }

        items.sort_by(|a, b| {
            a.booking
                .span
                .start
                .cmp(&b.booking.span.start)
                .then(a.booking.id.cmp(&b.booking.id))
        });
        paginate(items, filter.page, DEFAULT_BOOKING_PAGE_SIZE, MAX_PAGE_SIZE)
    }

    /// Non-cancelled bookings of `user_id` starting within the next `days` days.
    pub async fn upcoming_bookings(
        &self,
        user_id: &str,
        days: Option<u32>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let days = days.unwrap_or(DEFAULT_UPCOMING_DAYS);
        if days > MAX_UPCOMING_DAYS {
            return Err(EngineError::LimitExceeded("upcoming window too wide"));
        }
        let now = self.now();
        let until = now + i64::from(days) * DAY_MS;

        let mut items: Vec<BookingInfo> = Vec::new();
        self.scan(|rs| {
            items.extend(
                rs.live()
                    .filter(|b| b.requester.user_id.as_deref() == Some(user_id))
                    .filter(|b| b.span.start >= now && b.span.start <= until)
                    .map(|b| rs.booking_info(b)),
            );
        })
        .await;
        items.sort_by(|a, b| {
            a.booking
                .span
                .start
                .cmp(&b.booking.span.start)
                .then(a.booking.id.cmp(&b.booking.id))
        });
        Ok(items)
    }

    // ── Availability and reporting ───────────────────────────

    /// Bookings and free slots of `resource_id` on `day` in the engine's zone.
    pub async fn availability(
        &self,
        resource_id: Ulid,
        day: NaiveDate,
    ) -> Result<DayAvailability, EngineError> {
        let guard = self.read_resource(resource_id).await?;
        let window = day_window(day, &self.zone)
            .ok_or(EngineError::LimitExceeded("day out of range"))?;

        let busy: Vec<&Booking> = conflicts(&guard, &window, None).collect();
        let free = free_slots(busy.iter().copied().map(|b| &b.span), &window);
        Ok(DayAvailability {
            resource: guard.info(),
            day,
            window,
            bookings: busy.into_iter().map(|b| guard.booking_info(b)).collect(),
            free,
        })
    }

    pub async fn resource_utilization(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Utilization, EngineError> {
        if end < start {
            return Err(EngineError::InvalidInterval { start, end });
        }
        if end.checked_sub(start).is_none_or(|width| width > MAX_QUERY_WINDOW_MS) {
            return Err(EngineError::LimitExceeded("reporting period too wide"));
        }
        let guard = self.read_resource(resource_id).await?;
        Ok(utilization(&guard, start, end))
    }

    /// Non-cancelled bookings that a booking over `[start, end)` would collide with.
    pub async fn find_conflicts(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let span = validate_interval(start, end)?;
        validate_span(&span)?;
        let guard = self.read_resource(resource_id).await?;
        Ok(conflicts(&guard, &span, exclude)
            .map(|b| guard.booking_info(b))
            .collect())
    }
}
