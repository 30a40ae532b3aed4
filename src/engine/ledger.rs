use chrono::{Datelike, NaiveDate};
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use super::filters::is_eligible;
use super::policy::{days_between, occurrence_span, today};
use super::supervisors::supervises;
use super::{Engine, EngineError, apply_to_slot};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifTrigger;
use crate::observability;

type SlotGuard = OwnedRwLockWriteGuard<SlotState>;

impl Engine {
    /// Book `user_id` into the slot on `date`, on behalf of `reserver_id`.
    pub async fn book_reservation(
        &self,
        slot_id: Ulid,
        date: NaiveDate,
        user_id: UserId,
        reserver_id: UserId,
    ) -> Result<Reservation, EngineError> {
        match self.try_book(slot_id, date, user_id, reserver_id).await {
            Ok(r) => {
                metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
                Ok(r)
            }
            Err(e) => {
                metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.code())
                    .increment(1);
                tracing::debug!(slot = %slot_id, %date, user = user_id, reserver = reserver_id, "booking rejected: {e}");
                Err(e)
            }
        }
    }

    async fn try_book(
        &self,
        slot_id: Ulid,
        date: NaiveDate,
        user_id: UserId,
        reserver_id: UserId,
    ) -> Result<Reservation, EngineError> {
        let today = today(self.clock.now_ms());
        if date < today {
            return Err(EngineError::PastDate(date));
        }

        let on_behalf = user_id != reserver_id;
        let student = self.require_profile(user_id).await?;
        let reserver = if on_behalf {
            self.caller_profile(reserver_id).await
        } else {
            student.clone()
        };

        // Supervisor bookings may displace the student's overlapping
        // reservations, so they lock every same-weekday slot up front.
        let mut guards = if on_behalf {
            self.lock_with_overlapping(slot_id).await?
        } else {
            vec![self.lock_slot(slot_id).await?]
        };
        let target = guards
            .iter()
            .position(|g| g.slot.id == slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;

        let st = &guards[target];
        let bound = if !on_behalf {
            self.policy.student_lookahead_days
        } else if supervises(st, &reserver) {
            self.policy.supervisor_lookahead_days
        } else {
            return Err(EngineError::Forbidden("only supervisors of the slot may book for others"));
        };
        if days_between(today, date) > i64::from(bound) {
            return Err(EngineError::TooFarInFuture { max_days: bound });
        }
        if !is_eligible(&student, &st.filters) {
            return Err(EngineError::NoAccess { slot_id, user_id });
        }
        if Weekday::from(date.weekday()) != st.slot.weekday {
            return Err(EngineError::WeekdayMismatch {
                date,
                expected: st.slot.weekday,
            });
        }
        if st.booked_by(date, user_id).is_some() {
            return Err(EngineError::AlreadyBooked { slot_id, date });
        }
        if st.count_on(date) >= st.slot.capacity as usize {
            return Err(EngineError::SlotFull {
                slot_id,
                date,
                capacity: st.slot.capacity,
            });
        }
        if st.reservations.len() >= MAX_RESERVATIONS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many reservations on slot"));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            slot_id,
            date,
            user_id,
            reserver_id,
        };

        // The student's overlapping reservations go in the same WAL write as
        // the booking, ahead of it.
        let mut events = Vec::new();
        let mut touched = Vec::new();
        if on_behalf {
            let booked = &st.slot;
            for (i, other) in guards.iter().enumerate() {
                if i == target || !other.slot.overlaps(booked) {
                    continue;
                }
                for r in other.reservations_on(date).iter().filter(|r| r.user_id == user_id) {
                    events.push(Event::ReservationCancelled {
                        id: r.id,
                        slot_id: other.slot.id,
                    });
                    touched.push(i);
                }
            }
        }
        events.push(Event::ReservationBooked {
            reservation: reservation.clone(),
        });
        touched.push(target);

        self.wal_append_all(events.clone()).await?;
        for (event, i) in events.iter().zip(touched) {
            apply_to_slot(&mut guards[i], event, &self.entity_to_slot);
            if let Event::ReservationCancelled { id, slot_id } = event {
                tracing::info!(reservation = %id, slot = %slot_id, by = %reservation.id, "reservation displaced");
            }
        }
        drop(guards);
        tracing::info!(
            reservation = %reservation.id,
            slot = %slot_id,
            %date,
            user = user_id,
            reserver = reserver_id,
            "reservation booked"
        );

        if on_behalf {
            self.notify_user(user_id, reservation.id, NotifTrigger::BookForced);
        }
        Ok(reservation)
    }

    /// Write-lock the slot and every other slot on the same weekday, in id
    /// order.
    async fn lock_with_overlapping(&self, slot_id: Ulid) -> Result<Vec<SlotGuard>, EngineError> {
        let weekday = self.get_slot(slot_id).await?.weekday;
        let mut ids = Vec::new();
        for (id, rs) in self.all_slot_states() {
            if id == slot_id || rs.read().await.slot.weekday == weekday {
                ids.push(id);
            }
        }
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lock_slot(id).await {
                Ok(g) => guards.push(g),
                Err(_) if id != slot_id => {}
                Err(e) => return Err(e),
            }
        }
        Ok(guards)
    }

    /// Cancel a reservation. Owners may cancel until it starts. Supervisors
    /// either ask the owner (`force = false`) or remove it outright. With
    /// `strict`, a nice request on a started reservation is refused instead
    /// of turned into a notification.
    pub async fn unbook_reservation(
        &self,
        reservation_id: Ulid,
        caller_id: UserId,
        force: bool,
        strict: bool,
    ) -> Result<UnbookOutcome, EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.resolve_entity_write(&reservation_id).await?;
        let reservation = guard
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;

        let span = occurrence_span(&guard.slot, reservation.date, &self.calendar)?;
        let state = ReservationState::at(&span, self.clock.now_ms());

        let mode = if reservation.user_id == caller_id {
            match state {
                ReservationState::Past => return Err(EngineError::AlreadyEnded(reservation_id)),
                ReservationState::Active => return Err(EngineError::AlreadyStarted(reservation_id)),
                ReservationState::Future => "self",
            }
        } else if supervises(&guard, &caller) {
            if state == ReservationState::Past {
                return Err(EngineError::AlreadyEnded(reservation_id));
            }
            if !force {
                if strict && state == ReservationState::Active {
                    return Err(EngineError::ForceRequired(reservation_id));
                }
                drop(guard);
                metrics::counter!(observability::UNBOOKINGS_TOTAL, "mode" => "requested").increment(1);
                tracing::info!(reservation = %reservation_id, by = caller_id, "unbook requested");
                self.notify_user(reservation.user_id, reservation_id, NotifTrigger::UnbookRequested);
                return Ok(UnbookOutcome::Requested);
            }
            "forced"
        } else {
            return Err(EngineError::Forbidden("only the owner or a supervisor may unbook"));
        };

        let event = Event::ReservationCancelled {
            id: reservation_id,
            slot_id: reservation.slot_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        metrics::counter!(observability::UNBOOKINGS_TOTAL, "mode" => mode).increment(1);
        tracing::info!(reservation = %reservation_id, by = caller_id, mode, "reservation cancelled");

        if mode == "forced" {
            self.notify_user(reservation.user_id, reservation_id, NotifTrigger::UnbookForced);
        }
        Ok(UnbookOutcome::Removed)
    }
}
