use ulid::Ulid;

use super::{Engine, EngineError};
use crate::identity::UserProfile;
use crate::limits::*;
use crate::model::*;

/// Explicit supervisor link, or a slot master.
pub(super) fn supervises(st: &SlotState, user: &UserProfile) -> bool {
    user.is_slot_master() || st.has_supervisor(user.id)
}

impl Engine {
    pub(super) fn assert_supervises(&self, st: &SlotState, user: &UserProfile) -> Result<(), EngineError> {
        if supervises(st, user) {
            Ok(())
        } else {
            tracing::debug!(slot = %st.slot.id, user = user.id, "caller is not a supervisor");
            Err(EngineError::NotSupervisor {
                slot_id: st.slot.id,
                user_id: user.id,
            })
        }
    }

    /// Link `user_id` as supervisor of the slot. Linking twice is a no-op.
    pub async fn add_supervisor(
        &self,
        slot_id: Ulid,
        user_id: UserId,
        caller_id: UserId,
    ) -> Result<(), EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.assert_supervises(&guard, &caller)?;
        if guard.has_supervisor(user_id) {
            return Ok(());
        }
        if guard.supervisors.len() >= MAX_SUPERVISORS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many supervisors on slot"));
        }

        let event = Event::SupervisorAdded {
            supervisor: Supervisor {
                id: Ulid::new(),
                slot_id,
                user_id,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(slot = %slot_id, user = user_id, by = caller_id, "supervisor added");
        Ok(())
    }

    /// Unlink a supervisor. Unlinking someone who isn't linked is a no-op.
    pub async fn remove_supervisor(
        &self,
        slot_id: Ulid,
        user_id: UserId,
        caller_id: UserId,
    ) -> Result<(), EngineError> {
        let caller = self.caller_profile(caller_id).await;
        let mut guard = self.lock_slot(slot_id).await?;
        self.assert_supervises(&guard, &caller)?;
        if !guard.has_supervisor(user_id) {
            return Ok(());
        }

        let event = Event::SupervisorRemoved { slot_id, user_id };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(slot = %slot_id, user = user_id, by = caller_id, "supervisor removed");
        Ok(())
    }

    /// Whether the user may act as supervisor of the slot.
    pub async fn is_supervisor(&self, user_id: UserId, slot_id: Ulid) -> Result<bool, EngineError> {
        let user = self.caller_profile(user_id).await;
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        Ok(supervises(&guard, &user))
    }

    /// Slots with an explicit supervisor link to the user, ordered by id.
    pub async fn slots_supervised_by(&self, user_id: UserId) -> Vec<Slot> {
        let mut out = Vec::new();
        for (_, rs) in self.all_slot_states() {
            let guard = rs.read().await;
            if guard.has_supervisor(user_id) {
                out.push(guard.slot.clone());
            }
        }
        out.sort_by_key(|s| s.id);
        out
    }
}
