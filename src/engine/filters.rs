use ulid::Ulid;

use super::policy::validate_cohort;
use super::{Engine, EngineError};
use crate::identity::UserProfile;
use crate::limits::*;
use crate::model::*;

/// A user may book a slot if any of its filters admits them. A filter admits
/// when each of its set criteria holds. No filters admit nobody.
pub fn is_eligible(user: &UserProfile, filters: &[SlotFilter]) -> bool {
    filters.iter().any(|f| filter_admits(f, user))
}

fn filter_admits(filter: &SlotFilter, user: &UserProfile) -> bool {
    let course_ok = filter.course_id.is_none_or(|c| user.enrolled_in(c));
    let cohort_ok = filter
        .cohort
        .as_deref()
        .is_none_or(|c| user.cohort.as_deref() == Some(c));
    course_ok && cohort_ok
}

impl Engine {
    pub async fn add_filter(
        &self,
        slot_id: Ulid,
        course_id: Option<CourseId>,
        cohort: Option<String>,
        caller_id: UserId,
    ) -> Result<SlotFilter, EngineError> {
        if course_id.is_none() && cohort.is_none() {
            return Err(EngineError::validation(
                "filter",
                "one of courseid or vintage must be set",
            ));
        }
        if let Some(c) = &cohort {
            validate_cohort(c)?;
        }

        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.assert_supervises(&guard, &caller)?;
        if guard.filters.len() >= MAX_FILTERS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many filters on slot"));
        }

        let filter = SlotFilter {
            id: Ulid::new(),
            slot_id,
            course_id,
            cohort,
        };
        let event = Event::FilterAdded {
            filter: filter.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(slot = %slot_id, filter = %filter.id, "filter added");
        Ok(filter)
    }

    pub async fn remove_filter(&self, filter_id: Ulid, caller_id: UserId) -> Result<(), EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.resolve_entity_write(&filter_id).await?;
        if !guard.filters.iter().any(|f| f.id == filter_id) {
            return Err(EngineError::NotFound(filter_id));
        }
        self.assert_supervises(&guard, &caller)?;

        let slot_id = guard.slot.id;
        let event = Event::FilterRemoved { id: filter_id, slot_id };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(slot = %slot_id, filter = %filter_id, "filter removed");
        Ok(())
    }

    /// Filters of a slot. Supervisors only, as they reveal who may book.
    pub async fn get_filters(&self, slot_id: Ulid, caller_id: UserId) -> Result<Vec<SlotFilter>, EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        self.assert_supervises(&guard, &caller)?;
        Ok(guard.filters.clone())
    }

    /// The subset of `slot_ids` the user may book.
    pub async fn filter_slots_for(&self, user: &UserProfile, slot_ids: &[Ulid]) -> Vec<Ulid> {
        let mut eligible = Vec::new();
        for id in slot_ids {
            let Some(rs) = self.get_slot_state(id) else {
                continue;
            };
            if is_eligible(user, &rs.read().await.filters) {
                eligible.push(*id);
            }
        }
        eligible
    }
}
