use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{CourseId, UserId};

/// Named capability held by a user. The identity service hands these out as a
/// bitmask; that encoding stays at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Admin,
    Manager,
    Teacher,
    Student,
    /// Acts as a supervisor of every slot.
    SlotMaster,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Admin,
        Capability::Manager,
        Capability::Teacher,
        Capability::Student,
        Capability::SlotMaster,
    ];

    pub fn flag(self) -> u32 {
        match self {
            Capability::Admin => 1,
            Capability::Manager => 2,
            Capability::Teacher => 4,
            Capability::Student => 8,
            Capability::SlotMaster => 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Decode a bitmask. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self::new(Capability::ALL.into_iter().filter(|c| bits & c.flag() != 0))
    }

    pub fn bits(&self) -> u32 {
        self.0.iter().fold(0, |acc, c| acc | c.flag())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }
}

impl From<u32> for CapabilitySet {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

impl From<CapabilitySet> for u32 {
    fn from(set: CapabilitySet) -> u32 {
        set.bits()
    }
}

/// What the reservation engine needs to know about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Courses the user is enrolled in.
    #[serde(default)]
    pub courses: BTreeSet<CourseId>,
    /// Cohort ("vintage") label, e.g. the class the student belongs to.
    #[serde(default)]
    pub cohort: Option<String>,
}

impl UserProfile {
    pub fn is_slot_master(&self) -> bool {
        self.capabilities.contains(Capability::SlotMaster)
    }

    pub fn enrolled_in(&self, course_id: CourseId) -> bool {
        self.courses.contains(&course_id)
    }
}

/// Source of user profiles. Backed by the external identity service in
/// production.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn profile(&self, user_id: UserId) -> Option<UserProfile>;
}

/// In-process directory, loaded from a JSON array of profiles.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: DashMap<UserId, UserProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let profiles: Vec<UserProfile> = serde_json::from_str(json)?;
        let dir = Self::new();
        for p in profiles {
            dir.insert(p);
        }
        Ok(dir)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn insert(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn profile(&self, user_id: UserId) -> Option<UserProfile> {
        self.users.get(&user_id).map(|e| e.value().clone())
    }
}
