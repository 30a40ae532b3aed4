mod error;
mod filters;
mod ledger;
mod policy;
mod queries;
mod slots;
mod supervisors;

pub use error::EngineError;
pub use filters::is_eligible;
pub use policy::BookingPolicy;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::calendar::UnitCalendar;
use crate::clock::{Clock, SystemClock};
use crate::identity::{CapabilitySet, Directory, UserProfile};
use crate::model::*;
use crate::notify::{NotifTrigger, Notification, NotifyHub};
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one transaction. They are flushed together and succeed
    /// or fail as a unit.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Point the writer at another file. Lets tests provoke write failures.
    #[cfg(test)]
    Redirect {
        path: PathBuf,
        response: oneshot::Sender<io::Result<()>>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let events: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(events as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'batch: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'batch;
            }
        }
    }
    // Flush even after an append error so half-buffered bytes don't ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
        #[cfg(test)]
        WalCommand::Redirect { path, response } => {
            let _ = response.send(wal.redirect(&path));
        }
    }
}

/// The slot booking engine: registry, eligibility filters, supervisors and
/// the reservation ledger, all behind per-slot locks.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) calendar: UnitCalendar,
    pub(super) policy: BookingPolicy,
    pub(super) clock: Arc<dyn Clock>,
    /// Reverse lookup: filter/reservation id → slot id
    pub(super) entity_to_slot: DashMap<Ulid, Ulid>,
    /// Held shared by slot creation, exclusively by compaction, so a new
    /// slot can't slip between the snapshot and the file swap.
    pub(super) registry_gate: RwLock<()>,
}

/// Apply an event to a slot's state. The caller holds the slot's lock.
fn apply_to_slot(st: &mut SlotState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SlotUpdated { slot } => st.slot = slot.clone(),
        Event::FilterAdded { filter } => {
            st.filters.push(filter.clone());
            entity_map.insert(filter.id, filter.slot_id);
        }
        Event::FilterRemoved { id, .. } => {
            st.remove_filter(*id);
            entity_map.remove(id);
        }
        Event::SupervisorAdded { supervisor } => {
            if !st.has_supervisor(supervisor.user_id) {
                st.supervisors.push(supervisor.clone());
            }
        }
        Event::SupervisorRemoved { user_id, .. } => {
            st.supervisors.retain(|s| s.user_id != *user_id);
        }
        Event::ReservationBooked { reservation } => {
            entity_map.insert(reservation.id, reservation.slot_id);
            st.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            st.remove_reservation(*id);
            entity_map.remove(id);
        }
        // Creation and deletion change the slot map itself.
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => {}
    }
}

fn state_from_created(slot: &Slot, supervisors: &[Supervisor]) -> SlotState {
    let mut st = SlotState::new(slot.clone());
    st.supervisors = supervisors.to_vec();
    st
}

fn unmap_slot_entities(st: &SlotState, entity_map: &DashMap<Ulid, Ulid>) {
    for f in &st.filters {
        entity_map.remove(&f.id);
    }
    for r in &st.reservations {
        entity_map.remove(&r.id);
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        directory: Arc<dyn Directory>,
        calendar: UnitCalendar,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_slot = DashMap::new();
        let mut replayed: HashMap<Ulid, SlotState> = HashMap::new();
        for event in &events {
            match event {
                Event::SlotCreated { slot, supervisors } => {
                    replayed.insert(slot.id, state_from_created(slot, supervisors));
                }
                Event::SlotDeleted { id } => {
                    if let Some(st) = replayed.remove(id) {
                        unmap_slot_entities(&st, &entity_to_slot);
                    }
                }
                other => {
                    if let Some(st) = replayed.get_mut(&other.slot_id()) {
                        apply_to_slot(st, other, &entity_to_slot);
                    }
                }
            }
        }

        let slots = DashMap::with_capacity(replayed.len());
        for (id, st) in replayed {
            slots.insert(id, Arc::new(RwLock::new(st)));
        }
        tracing::info!(events = events.len(), slots = slots.len(), "replayed WAL");

        Ok(Self {
            slots,
            wal_tx,
            notify,
            directory,
            calendar,
            policy,
            clock: Arc::new(SystemClock),
            entity_to_slot,
            registry_gate: RwLock::new(()),
        })
    }

    /// Replace the time source. Used by tests to pin "now".
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn calendar(&self) -> &UnitCalendar {
        &self.calendar
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one unit: all of them become durable or none.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn get_slot_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_slot.get(entity_id).map(|e| *e.value())
    }

    /// Snapshot of every slot handle. Never hold a map ref across an await.
    pub(super) fn all_slot_states(&self) -> Vec<(Ulid, SharedSlotState)> {
        self.slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// WAL-append, then apply to the locked state.
    pub(super) async fn persist_and_apply(
        &self,
        st: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(st, event, &self.entity_to_slot);
        Ok(())
    }

    /// Acquire a slot's write lock. Fails if the slot was deleted while we waited.
    pub(super) async fn lock_slot(
        &self,
        slot_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.write_owned().await;
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }
        Ok(guard)
    }

    /// Lookup entity → slot, then lock the slot.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .get_slot_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_slot(slot_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    pub(super) async fn require_profile(&self, user_id: UserId) -> Result<UserProfile, EngineError> {
        self.directory
            .profile(user_id)
            .await
            .ok_or(EngineError::UnknownUser(user_id))
    }

    /// Profile for authorization checks. Users the directory doesn't know
    /// hold no capabilities but may still be linked supervisors.
    pub(super) async fn caller_profile(&self, user_id: UserId) -> UserProfile {
        self.directory
            .profile(user_id)
            .await
            .unwrap_or_else(|| UserProfile {
                id: user_id,
                capabilities: CapabilitySet::default(),
                courses: Default::default(),
                cohort: None,
            })
    }

    pub(super) fn notify_user(&self, user_id: UserId, reservation_id: Ulid, trigger: NotifTrigger) {
        self.notify.send(Notification {
            user_id,
            reservation_id,
            trigger,
            timestamp: self.clock.now_ms(),
        });
    }

    // ── WAL compaction ───────────────────────────────────

    /// Rewrite the WAL as the minimal event set reproducing current state.
    /// Every slot stays read-locked until the new file is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.registry_gate.write().await;
        let mut handles = self.all_slot_states();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (id, rs) in handles {
            let guard = rs.read_owned().await;
            if self.slots.contains_key(&id) {
                guards.push(guard);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::SlotCreated {
                slot: guard.slot.clone(),
                supervisors: guard.supervisors.clone(),
            });
            events.extend(guard.filters.iter().map(|f| Event::FilterAdded { filter: f.clone() }));
            events.extend(guard.reservations.iter().map(|r| Event::ReservationBooked {
                reservation: r.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    #[cfg(test)]
    pub(super) async fn redirect_wal(&self, path: PathBuf) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Redirect { path, response: tx })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await.map_err(|_| io::Error::other("WAL writer dropped response"))?
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
