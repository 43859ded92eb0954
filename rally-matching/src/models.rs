use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Profile ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkillLevel {
    Beginner,
    Intermediate,
    Advanced,
    #[serde(alias = "Professional")]
    Pro,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub day: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub skill_level: Option<SkillLevel>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub availability: Vec<AvailabilitySlot>,
    #[serde(default)]
    pub age: Option<u32>,
    pub created_at: DateTime<Utc>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<AvailabilitySlot>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<AvailabilitySlot>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A point on the globe, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl Profile {
    pub fn position(&self) -> Option<GeoPoint> {
        Some(GeoPoint::new(self.latitude?, self.longitude?))
    }
}

/// A discovery result: the profile plus what the ranker learned about it.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub profile: Profile,
    pub has_liked_me: bool,
    pub distance_km: Option<f64>,
}

// --- Swipe ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeAction {
    Like,
    Pass,
}

impl SwipeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwipeAction::Like => "like",
            SwipeAction::Pass => "pass",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swipe {
    pub id: Uuid,
    pub user_id: Uuid,
    pub target_user_id: Uuid,
    pub action: SwipeAction,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NewSwipe {
    pub user_id: Uuid,
    pub target_user_id: Uuid,
    pub action: SwipeAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwipeOutcome {
    pub is_match: bool,
    pub match_id: Option<Uuid>,
}

// --- Match ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Match {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `user_id`.
    pub fn counterpart(&self, user_id: Uuid) -> Uuid {
        if self.user1_id == user_id {
            self.user2_id
        } else {
            self.user1_id
        }
    }
}

/// Row for a new match, always in canonical order (smaller id first).
#[derive(Debug, Serialize)]
pub struct NewMatch {
    pub user1_id: Uuid,
    pub user2_id: Uuid,
}

impl NewMatch {
    pub fn between(a: Uuid, b: Uuid) -> Self {
        // Byte order of a uuid is the order of its hyphenated text form.
        Self {
            user1_id: a.min(b),
            user2_id: a.max(b),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchedProfile {
    pub profile: Profile,
    pub match_id: Uuid,
    pub matched_at: DateTime<Utc>,
}

/// A match as the dashboard shows it: counterpart plus the session banner, if any.
#[derive(Debug, Clone, Serialize)]
pub struct MatchSummary {
    #[serde(flatten)]
    pub matched: MatchedProfile,
    pub active_proposal: Option<MatchProposal>,
}

// --- Proposal ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Declined => "declined",
            ProposalStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that still show a banner.
    pub fn is_active(&self) -> bool {
        matches!(self, ProposalStatus::Pending | ProposalStatus::Accepted)
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted) | (Pending, Declined) | (Pending, Cancelled) | (Accepted, Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchProposal {
    pub id: Uuid,
    pub match_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub court_name: Option<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct NewProposal {
    pub match_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub court_name: Option<String>,
    pub status: ProposalStatus,
}
