use ulid::Ulid;

use crate::identity::UserProfile;
use crate::model::*;

use super::filters::is_eligible;
use super::policy::{days_between, next_occurrence, occurrence_span, today};
use super::supervisors::supervises;
use super::{Engine, EngineError};

/// Which slots a listing keeps, judged under each slot's read lock.
enum Listing<'a> {
    All,
    /// Eligible for the user, next occurrence at most `days` away.
    Bookable { user: &'a UserProfile, days: u32 },
    /// Supervised by `supervisor`, eligible for `student`, next occurrence
    /// fewer than `days` away.
    BookableBy {
        supervisor: &'a UserProfile,
        student: &'a UserProfile,
        days: u32,
    },
    SupervisedBy(UserId),
}

impl Engine {
    /// Slot record for `viewer`: next-occurrence fullness and whether the
    /// viewer holds a live reservation on it.
    fn slot_info(&self, st: &SlotState, viewer: UserId, now: Ms) -> Result<SlotInfo, EngineError> {
        let (next_date, _) = next_occurrence(&st.slot, now, &self.calendar)?;
        let mut for_curuser = false;
        for r in st.reservations.iter().filter(|r| r.user_id == viewer) {
            let span = occurrence_span(&st.slot, r.date, &self.calendar)?;
            if ReservationState::at(&span, now) != ReservationState::Past {
                for_curuser = true;
                break;
            }
        }
        Ok(SlotInfo {
            slot: st.slot.clone(),
            fullness: st.count_on(next_date),
            for_curuser,
            supervisors: st.supervisor_ids(),
            filters: st.filters.clone(),
        })
    }

    async fn list(&self, listing: Listing<'_>, viewer: UserId) -> Result<Vec<SlotInfo>, EngineError> {
        let now = self.clock.now_ms();
        let today = today(now);
        let mut out = Vec::new();
        for (_, rs) in self.all_slot_states() {
            let st = rs.read().await;
            let keep = match &listing {
                Listing::All => true,
                Listing::SupervisedBy(user_id) => st.has_supervisor(*user_id),
                Listing::Bookable { user, days } => {
                    let (date, _) = next_occurrence(&st.slot, now, &self.calendar)?;
                    is_eligible(user, &st.filters) && days_between(today, date) <= i64::from(*days)
                }
                Listing::BookableBy {
                    supervisor,
                    student,
                    days,
                } => {
                    let (date, _) = next_occurrence(&st.slot, now, &self.calendar)?;
                    supervises(&st, supervisor)
                        && is_eligible(student, &st.filters)
                        && days_between(today, date) < i64::from(*days)
                }
            };
            if keep {
                out.push(self.slot_info(&st, viewer, now)?);
            }
        }
        out.sort_by_key(|info| info.slot.id);
        Ok(out)
    }

    /// Every slot. Slot masters only.
    pub async fn get_all_slots(&self, caller_id: UserId) -> Result<Vec<SlotInfo>, EngineError> {
        let caller = self.caller_profile(caller_id).await;
        if !caller.is_slot_master() {
            return Err(EngineError::Forbidden("listing all slots requires the slot master capability"));
        }
        self.list(Listing::All, caller_id).await
    }

    /// Slots the caller may book that come up within the next few days.
    pub async fn get_my_slots(&self, caller_id: UserId) -> Result<Vec<SlotInfo>, EngineError> {
        let caller = self.require_profile(caller_id).await?;
        let days = self.policy.my_slots_window_days;
        self.list(Listing::Bookable { user: &caller, days }, caller_id)
            .await
    }

    /// Slots the caller supervises and could book `user_id` into.
    pub async fn get_student_slots(
        &self,
        caller_id: UserId,
        user_id: UserId,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let supervisor = self.caller_profile(caller_id).await;
        let student = self.require_profile(user_id).await?;
        let listing = Listing::BookableBy {
            supervisor: &supervisor,
            student: &student,
            days: self.policy.supervisor_lookahead_days,
        };
        self.list(listing, user_id).await
    }

    pub async fn get_supervisor_slots(&self, caller_id: UserId) -> Result<Vec<SlotInfo>, EngineError> {
        self.list(Listing::SupervisedBy(caller_id), caller_id).await
    }

    /// Live (not yet ended) reservations of a slot, by date.
    pub async fn get_slot_reservations(
        &self,
        slot_id: Ulid,
        caller_id: UserId,
    ) -> Result<Vec<Reservation>, EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let st = rs.read().await;
        self.assert_supervises(&st, &caller)?;

        let now = self.clock.now_ms();
        let mut out = Vec::new();
        for r in &st.reservations {
            let span = occurrence_span(&st.slot, r.date, &self.calendar)?;
            if ReservationState::at(&span, now) != ReservationState::Past {
                out.push(r.clone());
            }
        }
        Ok(out)
    }

    /// The caller's Future and Active reservations, by date.
    pub async fn get_my_reservations(&self, caller_id: UserId) -> Result<Vec<Reservation>, EngineError> {
        let now = self.clock.now_ms();
        let mut out = Vec::new();
        for (_, rs) in self.all_slot_states() {
            let st = rs.read().await;
            for r in st.reservations.iter().filter(|r| r.user_id == caller_id) {
                let span = occurrence_span(&st.slot, r.date, &self.calendar)?;
                if ReservationState::at(&span, now) != ReservationState::Past {
                    out.push(r.clone());
                }
            }
        }
        out.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
