//! Hard limits. Everything a client controls is bounded here.

/// Maximum number of slots per instance.
pub const MAX_SLOTS: usize = 10_000;

/// Maximum eligibility filters attached to a single slot.
pub const MAX_FILTERS_PER_SLOT: usize = 256;

/// Maximum supervisors linked to a single slot.
pub const MAX_SUPERVISORS_PER_SLOT: usize = 256;

/// Maximum reservations kept on a single slot (all dates).
pub const MAX_RESERVATIONS_PER_SLOT: usize = 100_000;

/// Room labels are between these lengths, in characters.
pub const MIN_ROOM_LEN: usize = 2;
pub const MAX_ROOM_LEN: usize = 7;

/// Cohort ("vintage") labels on filters.
pub const MAX_COHORT_LEN: usize = 7;

/// Longest accepted RPC line in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Upper bound on any configured lookahead, in days.
pub const MAX_LOOKAHEAD_DAYS: u32 = 366;
