use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use super::policy::{occurrence_span, validate_slot};
use super::{Engine, EngineError, state_from_created, unmap_slot_entities};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifTrigger;

impl Engine {
    /// Create a slot. The creator becomes its first supervisor.
    pub async fn create_slot(
        &self,
        start_unit: u32,
        duration: u32,
        weekday: Weekday,
        room: String,
        capacity: u32,
        creator_id: UserId,
    ) -> Result<Slot, EngineError> {
        let slot = Slot {
            id: Ulid::new(),
            start_unit,
            duration,
            weekday,
            room,
            capacity,
        };
        validate_slot(&slot, &self.calendar)?;

        let _gate = self.registry_gate.read().await;
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        let supervisors = vec![Supervisor {
            id: Ulid::new(),
            slot_id: slot.id,
            user_id: creator_id,
        }];
        let event = Event::SlotCreated {
            slot: slot.clone(),
            supervisors: supervisors.clone(),
        };
        self.wal_append(&event).await?;
        self.slots.insert(
            slot.id,
            Arc::new(RwLock::new(state_from_created(&slot, &supervisors))),
        );
        tracing::info!(slot = %slot.id, creator = creator_id, room = %slot.room, "slot created");
        Ok(slot)
    }

    /// Apply a patch. Reservations are never dropped: date buckets that now
    /// hold more than the new capacity come back as warnings.
    pub async fn update_slot(
        &self,
        slot_id: Ulid,
        patch: SlotPatch,
        caller_id: UserId,
    ) -> Result<UpdateOutcome, EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.assert_supervises(&guard, &caller)?;

        let updated = patch.apply(&guard.slot);
        validate_slot(&updated, &self.calendar)?;
        let now = self.clock.now_ms();
        if updated.weekday != guard.slot.weekday {
            // Booked dates are fixed to the current weekday.
            for r in &guard.reservations {
                let span = occurrence_span(&guard.slot, r.date, &self.calendar)?;
                if ReservationState::at(&span, now) != ReservationState::Past {
                    return Err(EngineError::validation(
                        "weekday",
                        "can't move a slot with live reservations to another day",
                    ));
                }
            }
        }
        let event = Event::SlotUpdated { slot: updated };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(slot = %slot_id, by = caller_id, "slot updated");

        let mut counts: BTreeMap<chrono::NaiveDate, usize> = BTreeMap::new();
        for r in &guard.reservations {
            *counts.entry(r.date).or_default() += 1;
        }
        let mut overfull = Vec::new();
        for (date, count) in counts {
            if count <= guard.slot.capacity as usize {
                continue;
            }
            let span = occurrence_span(&guard.slot, date, &self.calendar)?;
            if ReservationState::at(&span, now) == ReservationState::Past {
                continue;
            }
            tracing::warn!(slot = %slot_id, %date, count, capacity = guard.slot.capacity, "slot overfull after update");
            overfull.push(OverfullBucket {
                date,
                count,
                capacity: guard.slot.capacity,
            });
        }
        Ok(UpdateOutcome { overfull })
    }

    /// Delete a slot with its filters, supervisors and reservations. Owners of
    /// live reservations are told their booking was removed.
    pub async fn delete_slot(&self, slot_id: Ulid, caller_id: UserId) -> Result<(), EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let guard = self.lock_slot(slot_id).await?;
        self.assert_supervises(&guard, &caller)?;

        let now = self.clock.now_ms();
        let mut affected = Vec::new();
        for r in &guard.reservations {
            let live = occurrence_span(&guard.slot, r.date, &self.calendar)
                .map(|span| ReservationState::at(&span, now) != ReservationState::Past)
                .unwrap_or(true);
            if live {
                affected.push((r.user_id, r.id));
            }
        }

        self.wal_append(&Event::SlotDeleted { id: slot_id }).await?;
        self.slots.remove(&slot_id);
        unmap_slot_entities(&guard, &self.entity_to_slot);
        drop(guard);
        tracing::info!(slot = %slot_id, by = caller_id, cancelled = affected.len(), "slot deleted");

        for (user_id, reservation_id) in affected {
            self.notify_user(user_id, reservation_id, NotifTrigger::UnbookForced);
        }
        Ok(())
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let slot = rs.read().await.slot.clone();
        Ok(slot)
    }

    /// Every slot, ordered by id.
    pub async fn list_slots(&self) -> Vec<Slot> {
        let mut out = Vec::with_capacity(self.slots.len());
        for (_, rs) in self.all_slot_states() {
            out.push(rs.read().await.slot.clone());
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
