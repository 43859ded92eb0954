use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A social notification (like, comment) written by server-side triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub sender_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub resource_id: Option<Uuid>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// An authoritative recount, before it is published as a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub messages: HashMap<Uuid, u32>,
    pub proposals: HashMap<Uuid, u32>,
    pub social: u32,
    /// Unread message and notification ids the recount observed.
    pub seen: HashSet<Uuid>,
}

/// A single push-driven increment, recorded while a recount is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Message { match_id: Uuid, id: Uuid },
    Social { id: Uuid },
}

impl UnreadCounts {
    /// Re-applies the deltas this recount did not observe and returns how many landed.
    /// Message deltas for matches outside the recount are dropped.
    pub fn replay(&mut self, deltas: &[Delta]) -> usize {
        let mut applied = 0;
        for delta in deltas {
            match *delta {
                Delta::Message { match_id, id } => {
                    if self.seen.contains(&id) {
                        continue;
                    }
                    if let Some(count) = self.messages.get_mut(&match_id) {
                        *count += 1;
                        self.seen.insert(id);
                        applied += 1;
                    }
                }
                Delta::Social { id } => {
                    if self.seen.insert(id) {
                        self.social += 1;
                        applied += 1;
                    }
                }
            }
        }
        applied
    }
}
