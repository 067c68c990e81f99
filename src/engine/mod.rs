mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod utilization;

pub use availability::{day_window, free_slots};
pub use conflict::{conflicts, find_conflict, has_conflict};
pub use error::{EngineError, ErrorKind};
pub use store::{SharedResourceState, Store};
pub use utilization::utilization;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::FixedOffset;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL on a background task. Appends that queue up while one batch is
/// being written are committed together under a single fsync.
struct WalWriter {
    wal: Wal,
    rx: mpsc::Receiver<WalCommand>,
}

impl WalWriter {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let WalCommand::Append { event, response } = cmd else {
                self.handle_control(cmd);
                continue;
            };

            let mut batch = vec![(event, response)];
            let mut deferred = None;
            while let Ok(next) = self.rx.try_recv() {
                match next {
                    WalCommand::Append { event, response } => batch.push((event, response)),
                    other => {
                        deferred = Some(other);
                        break;
                    }
                }
            }

            self.commit(batch);
            if let Some(cmd) = deferred {
                self.handle_control(cmd);
            }
        }
    }

    fn commit(&mut self, batch: Vec<PendingAppend>) {
        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = Instant::now();

        // Every caller of a failed batch skips its apply, so none of it may persist.
        let staged = batch
            .iter()
            .try_for_each(|(event, _)| self.wal.append_buffered(event));
        let result = match staged {
            Ok(()) => self.wal.flush_sync(),
            Err(e) => {
                self.wal.discard_pending();
                Err(e)
            }
        };

        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }
    }

    fn handle_control(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(self.wal.path(), &events)
                    .and_then(|()| self.wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append { event, response } => self.commit(vec![(event, response)]),
        }
    }
}

/// Booking engine for one scope (tenant). All state lives in memory and is
/// rebuilt from the WAL on start-up.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reference zone used to turn calendar days into time windows.
    pub(super) zone: FixedOffset,
    pub(super) clock: Arc<dyn Clock>,
    /// Mutations hold this shared; compaction holds it exclusively so no append can
    /// land between the state snapshot and the log swap. Always taken before any
    /// resource lock.
    compaction_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, zone: FixedOffset) -> io::Result<Self> {
        Self::with_clock(wal_path, zone, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        zone: FixedOffset,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, rx) = mpsc::channel(4096);
        tokio::spawn(WalWriter { wal, rx }.run());

        let engine = Self {
            store: Store::new(),
            wal_tx,
            zone,
            clock,
            compaction_gate: RwLock::new(()),
        };
        engine.replay(&events);
        tracing::info!(
            "replayed {} events from {}: {} resources",
            events.len(),
            wal_path.display(),
            engine.store.resource_count()
        );
        Ok(engine)
    }

    /// Rebuild in-memory state. We are the sole owner of every lock here, so
    /// `try_write` always succeeds; blocking lock calls would panic if this runs
    /// inside an async context (lazy tenant creation).
    fn replay(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    kind,
                    active,
                    metadata,
                    at,
                } => {
                    self.store.insert_resource(ResourceState::new(
                        *id,
                        name.clone(),
                        *kind,
                        *active,
                        metadata.clone(),
                        *at,
                    ));
                }
                Event::ResourceDeleted { id } => {
                    if let Some(rs) = self.store.get_resource(id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.store.retire_resource(&mut guard);
                    }
                }
                other => {
                    if let Some(resource_id) = other.resource_id()
                        && let Some(rs) = self.store.get_resource(&resource_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.store.apply_event(&mut guard, other);
                    }
                }
            }
        }
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    pub(super) async fn mutation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction_gate.read().await
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. The caller holds the resource's write lock across both.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(rs, event);
        Ok(())
    }

    /// Resource handle → write lock, rejecting resources deleted while we waited.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard)
    }

    /// Booking → owning resource → write lock, re-checking the booking under the lock.
    pub(super) async fn lock_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .store
            .resource_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self
            .lock_resource(resource_id)
            .await
            .map_err(|_| EngineError::NotFound(booking_id))?;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction_gate.write().await;
        let mut events = Vec::new();
        for rs in self.store.resources() {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind,
                active: guard.active,
                metadata: guard.metadata.clone(),
                at: guard.created_at,
            });
            if guard.updated_at != guard.created_at {
                events.push(Event::ResourceUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    kind: guard.kind,
                    active: guard.active,
                    metadata: guard.metadata.clone(),
                    at: guard.updated_at,
                });
            }
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
