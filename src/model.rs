use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC).
pub type Ms = i64;

/// User id as issued by the identity service.
pub type UserId = u64;

/// Course id as issued by the course catalogue.
pub type CourseId = u64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }
}

/// Day of the week a slot recurs on. Wire form is 1 (Monday) ..= 7 (Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub fn number(self) -> u8 {
        self.to_chrono().number_from_monday() as u8
    }

    pub fn to_chrono(self) -> chrono::Weekday {
        match self {
            Weekday::Monday => chrono::Weekday::Mon,
            Weekday::Tuesday => chrono::Weekday::Tue,
            Weekday::Wednesday => chrono::Weekday::Wed,
            Weekday::Thursday => chrono::Weekday::Thu,
            Weekday::Friday => chrono::Weekday::Fri,
            Weekday::Saturday => chrono::Weekday::Sat,
            Weekday::Sunday => chrono::Weekday::Sun,
        }
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

impl TryFrom<u8> for Weekday {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Ok(match n {
            1 => Weekday::Monday,
            2 => Weekday::Tuesday,
            3 => Weekday::Wednesday,
            4 => Weekday::Thursday,
            5 => Weekday::Friday,
            6 => Weekday::Saturday,
            7 => Weekday::Sunday,
            other => return Err(format!("weekday must be 1 (Monday) to 7 (Sunday), got {other}")),
        })
    }
}

impl From<Weekday> for u8 {
    fn from(day: Weekday) -> u8 {
        day.number()
    }
}

/// A recurring weekly booking opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    #[serde(rename = "startunit")]
    pub start_unit: u32,
    pub duration: u32,
    pub weekday: Weekday,
    pub room: String,
    /// Seats per date. Zero disables booking without dropping history.
    #[serde(rename = "size")]
    pub capacity: u32,
}

impl Slot {
    /// True if both slots recur on the same weekday with intersecting unit ranges.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.weekday == other.weekday
            && self.start_unit < other.start_unit + other.duration
            && other.start_unit < self.start_unit + self.duration
    }
}

/// Partial update for a slot; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlotPatch {
    #[serde(default, rename = "startunit")]
    pub start_unit: Option<u32>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub weekday: Option<Weekday>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default, rename = "size")]
    pub capacity: Option<u32>,
}

impl SlotPatch {
    pub fn apply(self, slot: &Slot) -> Slot {
        Slot {
            id: slot.id,
            start_unit: self.start_unit.unwrap_or(slot.start_unit),
            duration: self.duration.unwrap_or(slot.duration),
            weekday: self.weekday.unwrap_or(slot.weekday),
            room: self.room.unwrap_or_else(|| slot.room.clone()),
            capacity: self.capacity.unwrap_or(slot.capacity),
        }
    }
}

/// Inclusion rule on a slot. At least one of `course_id` / `cohort` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFilter {
    pub id: Ulid,
    #[serde(rename = "slotid")]
    pub slot_id: Ulid,
    #[serde(rename = "courseid")]
    pub course_id: Option<CourseId>,
    #[serde(rename = "vintage")]
    pub cohort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supervisor {
    pub id: Ulid,
    #[serde(rename = "slotid")]
    pub slot_id: Ulid,
    #[serde(rename = "userid")]
    pub user_id: UserId,
}

/// One booked occurrence of a slot on a concrete date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    #[serde(rename = "slotid")]
    pub slot_id: Ulid,
    pub date: NaiveDate,
    #[serde(rename = "userid")]
    pub user_id: UserId,
    #[serde(rename = "reserverid")]
    pub reserver_id: UserId,
}

/// Where a reservation sits relative to "now". Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Future,
    Active,
    Past,
}

impl ReservationState {
    pub fn at(span: &Span, now: Ms) -> Self {
        if span.end <= now {
            ReservationState::Past
        } else if span.start <= now {
            ReservationState::Active
        } else {
            ReservationState::Future
        }
    }
}

/// Everything owned by a slot. Guarded by one lock so bookings, edits and
/// deletion of the same slot serialize.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub filters: Vec<SlotFilter>,
    pub supervisors: Vec<Supervisor>,
    /// Sorted by `date`.
    pub reservations: Vec<Reservation>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            filters: Vec::new(),
            supervisors: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn has_supervisor(&self, user_id: UserId) -> bool {
        self.supervisors.iter().any(|s| s.user_id == user_id)
    }

    pub fn supervisor_ids(&self) -> Vec<UserId> {
        self.supervisors.iter().map(|s| s.user_id).collect()
    }

    /// Insert reservation keeping the `date` order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.date <= reservation.date);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations in the `(slot, date)` bucket.
    pub fn reservations_on(&self, date: NaiveDate) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.date < date);
        let hi = self.reservations.partition_point(|r| r.date <= date);
        &self.reservations[lo..hi]
    }

    pub fn count_on(&self, date: NaiveDate) -> usize {
        self.reservations_on(date).len()
    }

    pub fn booked_by(&self, date: NaiveDate, user_id: UserId) -> Option<&Reservation> {
        self.reservations_on(date).iter().find(|r| r.user_id == user_id)
    }

    pub fn remove_filter(&mut self, id: Ulid) -> Option<SlotFilter> {
        let pos = self.filters.iter().position(|f| f.id == id)?;
        Some(self.filters.remove(pos))
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A new slot together with its initial supervisors (the creator, or the
    /// full set when written by compaction).
    SlotCreated {
        slot: Slot,
        supervisors: Vec<Supervisor>,
    },
    SlotUpdated {
        slot: Slot,
    },
    SlotDeleted {
        id: Ulid,
    },
    FilterAdded {
        filter: SlotFilter,
    },
    FilterRemoved {
        id: Ulid,
        slot_id: Ulid,
    },
    SupervisorAdded {
        supervisor: Supervisor,
    },
    SupervisorRemoved {
        slot_id: Ulid,
        user_id: UserId,
    },
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        slot_id: Ulid,
    },
}

impl Event {
    /// The slot an event belongs to.
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotCreated { slot, .. } | Event::SlotUpdated { slot } => slot.id,
            Event::SlotDeleted { id } => *id,
            Event::FilterAdded { filter } => filter.slot_id,
            Event::SupervisorAdded { supervisor } => supervisor.slot_id,
            Event::ReservationBooked { reservation } => reservation.slot_id,
            Event::FilterRemoved { slot_id, .. }
            | Event::SupervisorRemoved { slot_id, .. }
            | Event::ReservationCancelled { slot_id, .. } => *slot_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Slot record as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    #[serde(flatten)]
    pub slot: Slot,
    /// Reservations in the bucket of the next occurrence.
    pub fullness: usize,
    /// Whether the caller holds a live reservation on this slot.
    pub for_curuser: bool,
    pub supervisors: Vec<UserId>,
    pub filters: Vec<SlotFilter>,
}

/// A `(slot, date)` bucket holding more reservations than the slot's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverfullBucket {
    pub date: NaiveDate,
    pub count: usize,
    pub capacity: u32,
}

/// Result of a committed slot update. Non-empty `overfull` is a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub overfull: Vec<OverfullBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnbookOutcome {
    /// The reservation was deleted.
    Removed,
    /// The owner was asked to unbook; nothing was deleted.
    Requested,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn slot(start_unit: u32, duration: u32, weekday: Weekday) -> Slot {
        Slot {
            id: Ulid::new(),
            start_unit,
            duration,
            weekday,
            room: "R1".into(),
            capacity: 2,
        }
    }

    fn reservation(slot_id: Ulid, date: NaiveDate, user_id: UserId) -> Reservation {
        Reservation {
            id: Ulid::new(),
            slot_id,
            date,
            user_id,
            reserver_id: user_id,
        }
    }

    #[test]
    fn reservation_state_boundaries() {
        let span = Span::new(1000, 2000);
        assert_eq!(ReservationState::at(&span, 999), ReservationState::Future);
        assert_eq!(ReservationState::at(&span, 1000), ReservationState::Active);
        assert_eq!(ReservationState::at(&span, 1999), ReservationState::Active);
        assert_eq!(ReservationState::at(&span, 2000), ReservationState::Past);
    }

    #[test]
    fn weekday_wire_form() {
        assert_eq!(serde_json::to_string(&Weekday::Monday).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Weekday>("7").unwrap(), Weekday::Sunday);
        assert!(serde_json::from_str::<Weekday>("0").is_err());
        assert!(serde_json::from_str::<Weekday>("8").is_err());
    }

    #[test]
    fn weekday_matches_chrono() {
        // 2026-10-19 is a Monday
        let d = date(2026, 10, 19);
        assert_eq!(Weekday::from(chrono::Datelike::weekday(&d)), Weekday::Monday);
        assert_eq!(Weekday::Friday.to_chrono(), chrono::Weekday::Fri);
    }

    #[test]
    fn slot_overlap_needs_same_weekday_and_units() {
        let a = slot(1, 2, Weekday::Monday);
        assert!(a.overlaps(&slot(2, 3, Weekday::Monday)));
        assert!(!a.overlaps(&slot(3, 1, Weekday::Monday))); // adjacent
        assert!(!a.overlaps(&slot(1, 2, Weekday::Tuesday)));
        assert!(a.overlaps(&slot(1, 1, Weekday::Monday)));
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let s = slot(3, 2, Weekday::Wednesday);
        let patched = SlotPatch {
            capacity: Some(0),
            room: Some("B204".into()),
            ..Default::default()
        }
        .apply(&s);
        assert_eq!(patched.id, s.id);
        assert_eq!(patched.start_unit, 3);
        assert_eq!(patched.weekday, Weekday::Wednesday);
        assert_eq!(patched.room, "B204");
        assert_eq!(patched.capacity, 0);
    }

    #[test]
    fn reservations_stay_sorted_and_bucketed() {
        let s = slot(1, 1, Weekday::Monday);
        let mut st = SlotState::new(s.clone());
        let later = reservation(s.id, date(2026, 11, 2), 1);
        let earlier = reservation(s.id, date(2026, 10, 26), 2);
        let same_day = reservation(s.id, date(2026, 10, 26), 3);
        st.insert_reservation(later.clone());
        st.insert_reservation(earlier.clone());
        st.insert_reservation(same_day.clone());

        assert_eq!(st.reservations[0].date, date(2026, 10, 26));
        assert_eq!(st.reservations[2].date, date(2026, 11, 2));
        assert_eq!(st.count_on(date(2026, 10, 26)), 2);
        assert_eq!(st.count_on(date(2026, 11, 2)), 1);
        assert_eq!(st.count_on(date(2026, 11, 9)), 0);
        assert_eq!(st.booked_by(date(2026, 10, 26), 3), Some(&same_day));
        assert!(st.booked_by(date(2026, 11, 2), 3).is_none());

        assert_eq!(st.remove_reservation(earlier.id), Some(earlier));
        assert!(st.remove_reservation(Ulid::new()).is_none());
        assert_eq!(st.count_on(date(2026, 10, 26)), 1);
    }

    #[test]
    fn reservation_wire_names() {
        let r = reservation(Ulid::new(), date(2026, 10, 26), 7);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["date"], "2026-10-26");
        assert_eq!(json["userid"], 7);
        assert_eq!(json["reserverid"], 7);
        assert!(json.get("slotid").is_some());
    }

    #[test]
    fn slot_info_flattens_slot() {
        let s = slot(2, 1, Weekday::Tuesday);
        let info = SlotInfo {
            slot: s,
            fullness: 1,
            for_curuser: true,
            supervisors: vec![9],
            filters: vec![],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["startunit"], 2);
        assert_eq!(json["weekday"], 2);
        assert_eq!(json["size"], 2);
        assert_eq!(json["fullness"], 1);
        assert_eq!(json["for_curuser"], true);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationBooked {
            reservation: reservation(Ulid::new(), date(2026, 10, 26), 4),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
